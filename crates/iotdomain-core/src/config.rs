//! Publisher configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{MESSAGE_TYPE_MARKER, WILDCARD_REMAINDER, WILDCARD_SEGMENT};
use crate::error::{PublisherError, PublisherResult};

/// Default heartbeat of the runtime loop
const DEFAULT_TICK_MS: u64 = 1000;

/// Default time between discovery republications
const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 15 * 60;

/// Default time between poll callbacks
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Settings of one publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherConfig {
    pub domain: String,
    pub publisher_id: String,
    /// Where the identity is persisted. `None` keeps it in memory only.
    pub identity_file: Option<PathBuf>,
    pub organization: String,
    pub location: String,
    pub tick_ms: u64,
    pub discovery_interval_secs: u64,
    pub poll_interval_secs: u64,
    /// Drop unsigned commands
    pub require_signed: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            domain: "local".to_string(),
            publisher_id: String::new(),
            identity_file: None,
            organization: String::new(),
            location: String::new(),
            tick_ms: DEFAULT_TICK_MS,
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            require_signed: true,
        }
    }
}

impl PublisherConfig {
    pub fn new(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            ..Default::default()
        }
    }

    /// Parse from JSON; absent fields take their defaults
    pub fn from_json_str(json: &str) -> PublisherResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Check that domain and publisher ID are usable as address segments
    pub fn validate(&self) -> PublisherResult<()> {
        check_segment("domain", &self.domain)?;
        check_segment("publisherId", &self.publisher_id)?;
        if self.tick_ms == 0 {
            return Err(PublisherError::Malformed("tickMs must be positive".to_string()));
        }
        Ok(())
    }
}

fn check_segment(name: &str, value: &str) -> PublisherResult<()> {
    if value.is_empty()
        || value.contains('/')
        || value.starts_with(MESSAGE_TYPE_MARKER)
        || value == WILDCARD_SEGMENT
        || value == WILDCARD_REMAINDER
    {
        return Err(PublisherError::Malformed(format!(
            "{} {:?} is not a valid address segment",
            name, value
        )));
    }
    Ok(())
}
