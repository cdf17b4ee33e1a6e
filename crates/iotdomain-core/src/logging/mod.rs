//! Structured logging for publishers
//!
//! All components log through `tracing`. This module only installs the
//! subscriber; nothing in the core sets it up implicitly.
//!
//! ```text
//! logs/
//! ├── 2026-10-18_home_pub1.jsonl
//! └── 2026-10-18_home_dss.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use iotdomain_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("iotdomain_core=info")
//!     .with_jsonl("./logs", "home/pub1")
//!     .init()?;
//! ```
//!
//! ```bash
//! # every rejected message, across publishers
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg == "Rejected message")'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, PublisherLogWriter};

/// Install a console subscriber with `filter` unless `RUST_LOG` overrides it
pub fn init(filter: &str) -> std::io::Result<()> {
    LoggingBuilder::new(filter).init()
}
