//! Publisher identities and the domain trust model
//!
//! ## Overview
//!
//! Every publisher owns one P-256 key pair and an identity document binding
//! the public key to `domain/publisherId`. Exactly two trust roots exist per
//! domain:
//!
//! - **Self-signed**: the identity is signed with its own key. Receivers
//!   trust it on first use. A later announcement with an equal or newer
//!   timestamp replaces the cached key, including for the DSS itself.
//! - **DSS-issued**: the Domain Security Service signed the identity. Only
//!   accepted once the DSS's own (self-signed) identity has been discovered.
//!   It replaces a cached self-signed identity and is never replaced by one.
//!
//! Announcements dated more than [`MAX_CLOCK_SKEW_SECS`] ahead of the
//! receiver's clock are refused, so a forged future timestamp cannot freeze
//! the cache.
//!
//! ## Lifecycle
//!
//! ```text
//! Unloaded ──setup──▶ SelfSigned ──DSS rotation──▶ DssIssued
//!                        ▲                              │
//!                        └──────── local recreate ──────┘
//! ```
//!
//! A rotation arrives as a [`FullIdentity`] encrypted for the current key and
//! signed by the DSS. The replacement is verified before it is installed.

mod document;
mod manager;
pub mod store;

pub use document::{
    create_self_signed, issue_identity, sign_identity, verify_identity, FullIdentity,
    IdentityRequest, Issuer, PublisherIdentity, DSS_PUBLISHER_ID, IDENTITY_VALIDITY_DAYS,
};
pub use manager::{IdentityManager, IdentityState, MAX_CLOCK_SKEW_SECS};
