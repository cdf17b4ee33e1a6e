//! Message bus transport
//!
//! The core only needs two operations from a bus: publish a text payload on an
//! address and subscribe to a wildcard pattern. [`MemoryBus`] implements them
//! in-process with MQTT-like retained messages, for tests and for wiring
//! several publishers together inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::address;
use crate::error::{PublisherError, PublisherResult};

/// Callback invoked with `(address, payload)` for every matching message
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Narrow publish/subscribe interface consumed by the core
pub trait Transport: Send + Sync {
    /// Publish a payload. Retained messages are replayed to later subscribers.
    fn publish(&self, address: &str, retained: bool, payload: &str) -> PublisherResult<()>;

    /// Subscribe to an address pattern (`+` and `#` wildcards allowed)
    fn subscribe(&self, pattern: &str, handler: MessageHandler);
}

/// A message seen by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub address: String,
    pub retained: bool,
    pub payload: String,
}

#[derive(Default)]
struct BusInner {
    subscriptions: Vec<(String, MessageHandler)>,
    retained: HashMap<String, String>,
    history: Vec<BusMessage>,
    closed: bool,
}

/// In-process bus with synchronous delivery.
///
/// Handlers run on the publishing thread after the bus lock is released, so a
/// handler may publish or subscribe again.
#[derive(Default)]
pub struct MemoryBus {
    inner: Mutex<BusInner>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Retained payload currently stored for an address
    pub fn retained(&self, address: &str) -> Option<String> {
        self.inner.lock().retained.get(address).cloned()
    }

    /// Every message published so far, oldest first
    pub fn history(&self) -> Vec<BusMessage> {
        self.inner.lock().history.clone()
    }

    /// Published messages whose address matches a pattern
    pub fn published_matching(&self, pattern: &str) -> Vec<BusMessage> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|m| address::matches(pattern, &m.address))
            .cloned()
            .collect()
    }

    /// Refuse further publishes, as a disconnected broker would
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }
}

impl Transport for MemoryBus {
    fn publish(&self, address: &str, retained: bool, payload: &str) -> PublisherResult<()> {
        let handlers: Vec<MessageHandler> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PublisherError::Transport("bus is closed".to_string()));
            }
            if retained {
                inner
                    .retained
                    .insert(address.to_string(), payload.to_string());
            }
            inner.history.push(BusMessage {
                address: address.to_string(),
                retained,
                payload: payload.to_string(),
            });
            inner
                .subscriptions
                .iter()
                .filter(|(pattern, _)| address::matches(pattern, address))
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        trace!(address, retained, subscribers = handlers.len(), "Publishing");
        for handler in handlers {
            handler(address, payload);
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) {
        let replay: Vec<(String, String)> = {
            let mut inner = self.inner.lock();
            inner
                .subscriptions
                .push((pattern.to_string(), handler.clone()));
            inner
                .retained
                .iter()
                .filter(|(address, _)| address::matches(pattern, address))
                .map(|(a, p)| (a.clone(), p.clone()))
                .collect()
        };

        debug!(pattern, retained = replay.len(), "Subscribed");
        for (address, payload) in replay {
            handler(&address, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<(String, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |address: &str, payload: &str| {
            sink.lock().push((address.to_string(), payload.to_string()));
        });
        (handler, seen)
    }

    #[test]
    fn test_publish_delivers_to_matching_subscribers() {
        let bus = MemoryBus::new();
        let (handler, seen) = collector();
        bus.subscribe("home/+/$identity", handler);

        bus.publish("home/pub1/$identity", false, "one").unwrap();
        bus.publish("home/pub1/node1/$node", false, "two").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("home/pub1/$identity".to_string(), "one".to_string()));
    }

    #[test]
    fn test_retained_replayed_on_subscribe() {
        let bus = MemoryBus::new();
        bus.publish("home/pub1/$identity", true, "first").unwrap();
        bus.publish("home/pub1/$identity", true, "second").unwrap();
        bus.publish("home/pub2/$identity", false, "not retained").unwrap();

        let (handler, seen) = collector();
        bus.subscribe("home/#", handler);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "second");
        assert_eq!(bus.retained("home/pub1/$identity").as_deref(), Some("second"));
    }

    #[test]
    fn test_handler_may_publish() {
        let bus = MemoryBus::new();
        let echo_bus = bus.clone();
        bus.subscribe(
            "ping",
            Arc::new(move |_: &str, payload: &str| {
                echo_bus.publish("pong", false, payload).unwrap();
            }),
        );

        bus.publish("ping", false, "hello").unwrap();
        assert_eq!(bus.published_matching("pong").len(), 1);
        assert_eq!(bus.history().len(), 2);
    }

    #[test]
    fn test_closed_bus_rejects_publish() {
        let bus = MemoryBus::new();
        bus.close();
        let result = bus.publish("a/b", false, "x");
        assert!(matches!(result, Err(PublisherError::Transport(_))));
    }
}
