//! # Transport Layer
//!
//! Publish/subscribe seam to the external broker.
//!
//! A transport must provide retained publishes: the broker keeps the last
//! retained payload per topic and hands it to any later subscriber. The
//! backlog channel relies on this to act as a durable queue.
//!
//! Inbound publishes are not returned from these calls. Each implementation
//! hands out a receiver of [`TransportMessage`] when it connects, and the
//! node drains that receiver on its dispatch task.

use async_trait::async_trait;

use crate::error::TransportError;

/// A publish received on a subscribed topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker replayed a retained value on subscribe
    pub retained: bool,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retained,
        }
    }
}

/// Pub/sub client handle
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on `topic`. With `retain`, the broker replaces the
    /// topic's retained value with this payload.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), TransportError>;

    /// Start receiving publishes on `topic`, including its retained value
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Whether an MQTT-style topic filter matches a concrete topic.
///
/// `+` matches one level, a trailing `#` matches the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("users/online", "users/online"));
        assert!(!topic_matches("users/online", "users/offline"));
        assert!(!topic_matches("messages", "messages/B"));
    }

    #[test]
    fn test_wildcards() {
        assert!(topic_matches("messages/+", "messages/B"));
        assert!(!topic_matches("messages/+", "messages/B/extra"));
        assert!(topic_matches("messages/#", "messages/B/extra"));
        assert!(topic_matches("#", "users/online"));
    }
}
