//! Discovery objects and command messages exchanged on the bus

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{base_address, make_address, Address, MessageType};
use crate::collection::Discoverable;
use crate::error::{PublisherError, PublisherResult};
use crate::identity::PublisherIdentity;

/// A node (device or service) announced by a publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiscovery {
    pub address: String,
    pub publisher_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub attr: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl NodeDiscovery {
    pub fn new(domain: &str, publisher_id: &str, node_id: &str, node_type: &str) -> Self {
        Self {
            address: make_address(domain, publisher_id, node_id, "", "", Some(MessageType::Node)),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            alias: String::new(),
            attr: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Alias if set, otherwise the node ID
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.node_id
        } else {
            &self.alias
        }
    }
}

impl Discoverable for NodeDiscovery {
    const MESSAGE_TYPE: MessageType = MessageType::Node;

    fn address(&self) -> &str {
        &self.address
    }
}

/// An input of a node that accepts `$set` commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDiscovery {
    pub address: String,
    pub publisher_id: String,
    pub node_id: String,
    pub input_type: String,
    pub instance: String,
    #[serde(default)]
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl InputDiscovery {
    pub fn new(
        domain: &str,
        publisher_id: &str,
        node_id: &str,
        input_type: &str,
        instance: &str,
    ) -> Self {
        Self {
            address: make_address(
                domain,
                publisher_id,
                node_id,
                input_type,
                instance,
                Some(MessageType::Input),
            ),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            input_type: input_type.to_string(),
            instance: instance.to_string(),
            value: String::new(),
            timestamp: Utc::now(),
        }
    }
}

impl Discoverable for InputDiscovery {
    const MESSAGE_TYPE: MessageType = MessageType::Input;

    fn address(&self) -> &str {
        &self.address
    }
}

/// An output of a node that publishes values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDiscovery {
    pub address: String,
    pub publisher_id: String,
    pub node_id: String,
    pub output_type: String,
    pub instance: String,
    #[serde(default)]
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputDiscovery {
    pub fn new(
        domain: &str,
        publisher_id: &str,
        node_id: &str,
        output_type: &str,
        instance: &str,
    ) -> Self {
        Self {
            address: make_address(
                domain,
                publisher_id,
                node_id,
                output_type,
                instance,
                Some(MessageType::Output),
            ),
            publisher_id: publisher_id.to_string(),
            node_id: node_id.to_string(),
            output_type: output_type.to_string(),
            instance: instance.to_string(),
            unit: String::new(),
            timestamp: Utc::now(),
        }
    }
}

impl Discoverable for OutputDiscovery {
    const MESSAGE_TYPE: MessageType = MessageType::Output;

    fn address(&self) -> &str {
        &self.address
    }
}

/// Any discovery object, selected by the message type of its address
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryObject {
    Identity(PublisherIdentity),
    Node(NodeDiscovery),
    Input(InputDiscovery),
    Output(OutputDiscovery),
}

impl DiscoveryObject {
    /// Parse a JSON payload as the variant for `message_type`
    pub fn from_payload(message_type: MessageType, payload: &[u8]) -> PublisherResult<Self> {
        Ok(match message_type {
            MessageType::Identity => DiscoveryObject::Identity(serde_json::from_slice(payload)?),
            MessageType::Node => DiscoveryObject::Node(serde_json::from_slice(payload)?),
            MessageType::Input => DiscoveryObject::Input(serde_json::from_slice(payload)?),
            MessageType::Output => DiscoveryObject::Output(serde_json::from_slice(payload)?),
            other => {
                return Err(PublisherError::Malformed(format!(
                    "{} is not a discovery message",
                    other
                )))
            }
        })
    }

    pub fn address(&self) -> &str {
        match self {
            DiscoveryObject::Identity(identity) => identity.address(),
            DiscoveryObject::Node(node) => node.address(),
            DiscoveryObject::Input(input) => input.address(),
            DiscoveryObject::Output(output) => output.address(),
        }
    }

    /// Check that the body names the publisher, node and I/O of `topic`
    pub fn check_fields(&self, topic: &Address) -> PublisherResult<()> {
        let (publisher_id, node_id, io) = match self {
            DiscoveryObject::Identity(identity) => (&identity.publisher_id, None, None),
            DiscoveryObject::Node(node) => (&node.publisher_id, Some(&node.node_id), None),
            DiscoveryObject::Input(input) => (
                &input.publisher_id,
                Some(&input.node_id),
                Some((&input.input_type, &input.instance)),
            ),
            DiscoveryObject::Output(output) => (
                &output.publisher_id,
                Some(&output.node_id),
                Some((&output.output_type, &output.instance)),
            ),
        };

        let consistent = *publisher_id == topic.publisher_id
            && node_id.map_or(true, |id| topic.node_id.as_ref() == Some(id))
            && io.map_or(true, |(io_type, instance)| {
                topic.io_type.as_ref() == Some(io_type) && topic.instance.as_ref() == Some(instance)
            });
        if consistent {
            return Ok(());
        }

        let mut actual = format!("{}/{}", topic.domain, publisher_id);
        if let Some(id) = node_id {
            actual = format!("{}/{}", actual, id);
        }
        if let Some((io_type, instance)) = io {
            actual = format!("{}/{}/{}", actual, io_type, instance);
        }
        Err(PublisherError::AddressMismatch {
            expected: base_address(&topic.to_string()),
            actual,
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            DiscoveryObject::Identity(_) => PublisherIdentity::MESSAGE_TYPE,
            DiscoveryObject::Node(_) => NodeDiscovery::MESSAGE_TYPE,
            DiscoveryObject::Input(_) => InputDiscovery::MESSAGE_TYPE,
            DiscoveryObject::Output(_) => OutputDiscovery::MESSAGE_TYPE,
        }
    }
}

/// A command that names the address it targets and the publisher that sent it
pub trait SenderMessage {
    /// Address the command targets
    fn address(&self) -> &str;

    /// Address of the sending publisher
    fn sender(&self) -> &str;
}

/// Request to change the value of an input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInputMessage {
    pub address: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

/// Request to change node configuration attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigureMessage {
    pub address: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub attr: BTreeMap<String, String>,
}

/// Request to give a node a display alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAliasMessage {
    pub address: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub alias: String,
}

macro_rules! impl_sender_message {
    ($($ty:ty),*) => {
        $(
            impl SenderMessage for $ty {
                fn address(&self) -> &str {
                    &self.address
                }

                fn sender(&self) -> &str {
                    &self.sender
                }
            }
        )*
    };
}

impl_sender_message!(SetInputMessage, NodeConfigureMessage, NodeAliasMessage);
