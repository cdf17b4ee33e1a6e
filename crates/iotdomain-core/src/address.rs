//! Hierarchical bus addresses
//!
//! Every message on the bus is published on an address of the form
//!
//! ```text
//! <domain>/<publisherId>[/<nodeId>[/<ioType>/<instance>]]/$<messageType>
//! ```
//!
//! The final `$`-prefixed segment names the kind of message. Stripping it gives
//! the *base address*, the natural key for "current state of this thing".
//!
//! Subscriptions may use `+` (exactly one segment) and `#` (the rest of the
//! address, including nothing) wildcards.

use std::fmt;
use std::str::FromStr;

use crate::error::{PublisherError, PublisherResult};

/// Marker that distinguishes a message type segment from a data segment
pub const MESSAGE_TYPE_MARKER: char = '$';

/// Single-level wildcard
pub const WILDCARD_SEGMENT: &str = "+";

/// Multi-level wildcard, only valid as the last pattern segment
pub const WILDCARD_REMAINDER: &str = "#";

/// Kind of message carried on an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Identity,
    Node,
    Input,
    Output,
    Configure,
    Set,
    Alias,
    Value,
    Latest,
    History,
    Forecast,
    Event,
}

impl MessageType {
    /// Name without the `$` marker
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Identity => "identity",
            MessageType::Node => "node",
            MessageType::Input => "input",
            MessageType::Output => "output",
            MessageType::Configure => "configure",
            MessageType::Set => "set",
            MessageType::Alias => "alias",
            MessageType::Value => "value",
            MessageType::Latest => "latest",
            MessageType::History => "history",
            MessageType::Forecast => "forecast",
            MessageType::Event => "event",
        }
    }

    /// Address segment including the `$` marker
    pub fn segment(&self) -> String {
        format!("{}{}", MESSAGE_TYPE_MARKER, self.as_str())
    }

    /// Parse a `$`-prefixed segment
    pub fn from_segment(segment: &str) -> Option<Self> {
        segment
            .strip_prefix(MESSAGE_TYPE_MARKER)
            .and_then(|name| name.parse().ok())
    }
}

impl FromStr for MessageType {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "identity" => MessageType::Identity,
            "node" => MessageType::Node,
            "input" => MessageType::Input,
            "output" => MessageType::Output,
            "configure" => MessageType::Configure,
            "set" => MessageType::Set,
            "alias" => MessageType::Alias,
            "value" => MessageType::Value,
            "latest" => MessageType::Latest,
            "history" => MessageType::History,
            "forecast" => MessageType::Forecast,
            "event" => MessageType::Event,
            other => {
                return Err(PublisherError::Malformed(format!(
                    "unknown message type: {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MESSAGE_TYPE_MARKER, self.as_str())
    }
}

/// Build an address from its parts.
///
/// Trailing empty data segments are omitted, so a publisher-level address
/// is `domain/publisher/$identity` rather than `domain/publisher////$identity`.
pub fn make_address(
    domain: &str,
    publisher_id: &str,
    node_id: &str,
    io_type: &str,
    instance: &str,
    message_type: Option<MessageType>,
) -> String {
    let mut segments = vec![domain, publisher_id, node_id, io_type, instance];
    while segments.last().is_some_and(|s| s.is_empty()) {
        segments.pop();
    }
    let mut address = segments.join("/");
    if let Some(message_type) = message_type {
        if !address.is_empty() {
            address.push('/');
        }
        address.push_str(&message_type.segment());
    }
    address
}

/// Strip trailing message type segments from an address.
///
/// Addresses without a message type are returned unchanged. Idempotent.
pub fn base_address(address: &str) -> String {
    let mut base = address;
    while let Some((head, last)) = base.rsplit_once('/') {
        if !last.starts_with(MESSAGE_TYPE_MARKER) {
            break;
        }
        base = head;
    }
    base.to_string()
}

/// Truncate any address to its `domain/publisherId` prefix.
///
/// Returns `None` when the address has fewer than two segments.
pub fn publisher_address(address: &str) -> Option<String> {
    let mut segments = address.split('/');
    let domain = segments.next().filter(|s| !s.is_empty())?;
    let publisher = segments
        .next()
        .filter(|s| !s.is_empty() && !s.starts_with(MESSAGE_TYPE_MARKER))?;
    Some(format!("{}/{}", domain, publisher))
}

/// Match an address against a subscription pattern.
pub fn matches(pattern: &str, address: &str) -> bool {
    let mut address_segments = address.split('/');
    for pattern_segment in pattern.split('/') {
        if pattern_segment == WILDCARD_REMAINDER {
            return true;
        }
        match address_segments.next() {
            None => return false,
            Some(segment) => {
                if pattern_segment != WILDCARD_SEGMENT && pattern_segment != segment {
                    return false;
                }
            }
        }
    }
    address_segments.next().is_none()
}

/// A parsed address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub domain: String,
    pub publisher_id: String,
    pub node_id: Option<String>,
    pub io_type: Option<String>,
    pub instance: Option<String>,
    pub message_type: Option<MessageType>,
}

impl Address {
    /// Publisher-level address (`domain/publisherId`)
    pub fn publisher(domain: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            publisher_id: publisher_id.into(),
            ..Default::default()
        }
    }

    /// Node-level address (`domain/publisherId/nodeId`)
    pub fn node(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::publisher(domain, publisher_id)
        }
    }

    /// Input/output address (`domain/publisherId/nodeId/ioType/instance`)
    pub fn io(
        domain: impl Into<String>,
        publisher_id: impl Into<String>,
        node_id: impl Into<String>,
        io_type: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            io_type: Some(io_type.into()),
            instance: Some(instance.into()),
            ..Self::node(domain, publisher_id, node_id)
        }
    }

    /// Same address with the given message type
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Same address without a message type
    pub fn base(&self) -> Self {
        Self {
            message_type: None,
            ..self.clone()
        }
    }

    /// `domain/publisherId`
    pub fn publisher_address(&self) -> String {
        format!("{}/{}", self.domain, self.publisher_id)
    }

    /// Parse an address string.
    ///
    /// Requires at least `domain/publisherId`. A `$`-prefixed last segment must
    /// be a known message type. At most three data segments may follow the
    /// publisher.
    pub fn parse(address: &str) -> PublisherResult<Self> {
        let mut segments: Vec<&str> = address.split('/').collect();

        let message_type = match segments.last() {
            Some(last) if last.starts_with(MESSAGE_TYPE_MARKER) => {
                let mt = MessageType::from_segment(last).ok_or_else(|| {
                    PublisherError::Malformed(format!("unknown message type in {}", address))
                })?;
                segments.pop();
                Some(mt)
            }
            _ => None,
        };

        if segments.len() < 2 || segments.len() > 5 {
            return Err(PublisherError::Malformed(format!(
                "address must have 2 to 5 data segments: {}",
                address
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PublisherError::Malformed(format!(
                "address has an empty segment: {}",
                address
            )));
        }
        if segments
            .iter()
            .any(|s| *s == WILDCARD_SEGMENT || *s == WILDCARD_REMAINDER)
        {
            return Err(PublisherError::Malformed(format!(
                "address contains a wildcard: {}",
                address
            )));
        }

        let owned = |i: usize| segments.get(i).map(|s| s.to_string());
        Ok(Self {
            domain: segments[0].to_string(),
            publisher_id: segments[1].to_string(),
            node_id: owned(2),
            io_type: owned(3),
            instance: owned(4),
            message_type,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = make_address(
            &self.domain,
            &self.publisher_id,
            self.node_id.as_deref().unwrap_or_default(),
            self.io_type.as_deref().unwrap_or_default(),
            self.instance.as_deref().unwrap_or_default(),
            self.message_type,
        );
        f.write_str(&address)
    }
}

impl FromStr for Address {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}
