use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default per-topic buffer for in-memory subscriptions. Slow subscribers
/// past this depth observe `Lagged` instead of stalling publishers.
pub const DEFAULT_TOPIC_DEPTH: usize = 1024;

/// One message as carried between server instances: an opaque payload
/// addressed to a topic. Interpretation of the payload is the caller's
/// business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus backlog full")]
    Backlog,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Broker seam between the fan-out pumps and whatever carries messages
/// across server instances. Publish must not suspend; implementations queue
/// internally and surface overload as `Backlog`. Delivery is at-least-once
/// and unordered across publishers.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus for tests and single-instance deployments. Every
/// subscriber of a topic sees every message published to it, which makes a
/// single `LocalBus` shared by two server harnesses behave like a broker
/// connecting two instances.
#[derive(Debug)]
pub struct LocalBus {
    depth: usize,
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_depth(DEFAULT_TOPIC_DEPTH)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth,
            topics: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        // A broadcast with no receivers is still a successful publish; the
        // instances that care simply are not running here.
        let _ = sender.send(BusMessage::new(topic, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("chat");
        bus.publish("chat", Bytes::from_static(b"hello"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "chat");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("chat");
        let mut second = bus.subscribe("chat");
        bus.publish("chat", Bytes::from_static(b"fan-out"))
            .expect("publish ok");
        assert_eq!(
            first.recv().await.expect("first").payload,
            Bytes::from_static(b"fan-out")
        );
        assert_eq!(
            second.recv().await.expect("second").payload,
            Bytes::from_static(b"fan-out")
        );
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut chat = bus.subscribe("chat");
        bus.publish("presence", Bytes::from_static(b"away"))
            .expect("publish ok");
        bus.publish("chat", Bytes::from_static(b"hi"))
            .expect("publish ok");
        let msg = chat.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "chat");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        bus.publish("chat", Bytes::from_static(b"unheard"))
            .expect("publish ok");
    }
}
