//! # Presence Discovery
//!
//! Peers find each other through one shared discovery topic:
//! - every node publishes its identity, position and RPC endpoint there with
//!   retain, so a late subscriber gets the last announcement immediately
//! - every node listens there and records what it hears in the
//!   [`PeerRegistry`]
//! - on hearing a new identity, a node re-announces itself so the newcomer
//!   learns about it without waiting for the next periodic broadcast
//!
//! Because all nodes share the topic, the broker only retains the most recent
//! announcer. The re-announce on first sight is what lets a newcomer learn
//! about the rest.

use std::sync::Arc;

use geochat_core::error::ProtocolError;
use geochat_core::types::{Coordinate, Identity, PeerAddress};
use geochat_core::wire::DiscoveryAnnouncement;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::peer::PeerRegistry;
use crate::transport::Transport;

/// This node's identity, position and advertised endpoint
#[derive(Debug)]
pub struct LocalPeer {
    identity: Identity,
    coordinate: RwLock<Coordinate>,
    address: PeerAddress,
}

impl LocalPeer {
    pub fn new(identity: impl Into<Identity>, coordinate: Coordinate, address: PeerAddress) -> Self {
        Self {
            identity: identity.into(),
            coordinate: RwLock::new(coordinate),
            address,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn coordinate(&self) -> Coordinate {
        *self.coordinate.read()
    }

    pub fn set_coordinate(&self, coordinate: Coordinate) {
        *self.coordinate.write() = coordinate;
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Announcement describing the current state
    pub fn announcement(&self) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement::new(self.identity.clone(), self.coordinate(), self.address.clone())
    }
}

/// Publishes this node's presence on the discovery topic
pub struct PresenceBroadcaster {
    local: Arc<LocalPeer>,
    transport: Arc<dyn Transport>,
    topic: String,
    stats: RwLock<PresenceStats>,
}

/// Presence statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceStats {
    pub announcements_sent: u64,
    pub announcements_failed: u64,
}

impl PresenceBroadcaster {
    pub fn new(local: Arc<LocalPeer>, transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            local,
            transport,
            topic: topic.into(),
            stats: RwLock::new(PresenceStats::default()),
        }
    }

    /// Publish the current announcement with retain.
    ///
    /// Safe to call repeatedly; the last publish wins. Transport failures are
    /// returned to the caller and not retried here.
    pub async fn announce(&self) -> Result<(), TransportError> {
        let announcement = self.local.announcement();
        let payload = announcement.encode().map_err(|e| TransportError::Publish {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(
            identity = %announcement.username,
            lat = announcement.latitude,
            lon = announcement.longitude,
            endpoint = %self.local.address(),
            "Publishing presence on '{}'",
            self.topic
        );

        match self.transport.publish(&self.topic, payload, true).await {
            Ok(()) => {
                self.stats.write().announcements_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.write().announcements_failed += 1;
                Err(e)
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> PresenceStats {
        self.stats.read().clone()
    }
}

/// Result of handling one discovery message
#[derive(Clone, Debug, PartialEq)]
pub enum ListenerOutcome {
    /// Payload was malformed and dropped
    Invalid(ProtocolError),
    /// Our own announcement echoed back
    IgnoredSelf,
    /// Registry updated
    Updated { identity: Identity, is_new: bool },
}

/// Consumes discovery messages into the [`PeerRegistry`]
pub struct PresenceListener {
    registry: Arc<PeerRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
    reply_to_new_peers: bool,
}

impl PresenceListener {
    pub fn new(
        registry: Arc<PeerRegistry>,
        broadcaster: Arc<PresenceBroadcaster>,
        reply_to_new_peers: bool,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            reply_to_new_peers,
        }
    }

    /// Handle a raw payload from the discovery topic
    pub async fn on_discovery_message(&self, raw: &[u8]) -> ListenerOutcome {
        let announcement = match DiscoveryAnnouncement::decode(raw) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::warn!("Dropping discovery message: {}", e);
                return ListenerOutcome::Invalid(e);
            }
        };

        if announcement.username == self.registry.local_identity() {
            tracing::trace!("Ignoring own announcement");
            return ListenerOutcome::IgnoredSelf;
        }

        let is_new = self.registry.upsert(
            &announcement.username,
            announcement.coordinate(),
            announcement.address(),
        );

        if is_new {
            tracing::info!(
                "New peer {} at {} ({})",
                announcement.username,
                announcement.coordinate(),
                announcement.address()
            );
            if self.reply_to_new_peers {
                if let Err(e) = self.broadcaster.announce().await {
                    tracing::warn!("Failed to re-announce for {}: {}", announcement.username, e);
                }
            }
        } else {
            tracing::debug!(
                "Peer {} updated to {}",
                announcement.username,
                announcement.coordinate()
            );
        }

        ListenerOutcome::Updated {
            identity: announcement.username,
            is_new,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn setup(identity: &str, broker: &MemoryBroker) -> (Arc<PeerRegistry>, Arc<PresenceBroadcaster>) {
        let (transport, _rx) = broker.connect(identity).unwrap();
        let local = Arc::new(LocalPeer::new(
            identity,
            Coordinate::new(40.0, -8.0),
            PeerAddress::new("127.0.0.1", 8000),
        ));
        let broadcaster = Arc::new(PresenceBroadcaster::new(local, Arc::new(transport), "users/online"));
        (Arc::new(PeerRegistry::new(identity)), broadcaster)
    }

    #[tokio::test]
    async fn test_announce_is_retained() {
        let broker = MemoryBroker::new();
        let (_, broadcaster) = setup("A", &broker);

        broadcaster.announce().await.unwrap();

        let retained = broker.retained("users/online").unwrap();
        let ann = DiscoveryAnnouncement::decode(&retained).unwrap();
        assert_eq!(ann.username, "A");
        assert_eq!(ann.port, 8000);
        assert_eq!(broadcaster.stats().announcements_sent, 1);
    }

    #[tokio::test]
    async fn test_missing_port_does_not_mutate_registry() {
        let broker = MemoryBroker::new();
        let (registry, broadcaster) = setup("A", &broker);
        let listener = PresenceListener::new(registry.clone(), broadcaster, true);

        let raw = br#"{"username":"B","latitude":40.0,"longitude":-8.001,"ip":"10.0.0.2"}"#;
        let outcome = listener.on_discovery_message(raw).await;

        assert!(matches!(outcome, ListenerOutcome::Invalid(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_self_announcement_ignored() {
        let broker = MemoryBroker::new();
        let (registry, broadcaster) = setup("A", &broker);
        let listener = PresenceListener::new(registry.clone(), broadcaster, true);

        let raw = br#"{"username":"A","latitude":40.0,"longitude":-8.0,"ip":"10.0.0.1","port":8000}"#;
        assert_eq!(listener.on_discovery_message(raw).await, ListenerOutcome::IgnoredSelf);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_new_peer_triggers_single_reannounce() {
        let broker = MemoryBroker::new();
        let (registry, broadcaster) = setup("A", &broker);
        let listener = PresenceListener::new(registry.clone(), broadcaster.clone(), true);

        let raw = br#"{"username":"B","latitude":40.0,"longitude":-8.001,"ip":"10.0.0.2","port":8001}"#;
        let outcome = listener.on_discovery_message(raw).await;
        assert_eq!(
            outcome,
            ListenerOutcome::Updated {
                identity: "B".to_string(),
                is_new: true
            }
        );
        assert_eq!(broadcaster.stats().announcements_sent, 1);

        // Known peer moving does not re-announce
        let raw = br#"{"username":"B","latitude":40.1,"longitude":-8.001,"ip":"10.0.0.2","port":8001}"#;
        listener.on_discovery_message(raw).await;
        assert_eq!(broadcaster.stats().announcements_sent, 1);
        assert_eq!(registry.get("B").unwrap().coordinate.latitude, 40.1);
    }

    #[tokio::test]
    async fn test_reply_disabled() {
        let broker = MemoryBroker::new();
        let (registry, broadcaster) = setup("A", &broker);
        let listener = PresenceListener::new(registry, broadcaster.clone(), false);

        let raw = br#"{"username":"B","latitude":40.0,"longitude":-8.001,"ip":"10.0.0.2","port":8001}"#;
        listener.on_discovery_message(raw).await;
        assert_eq!(broadcaster.stats().announcements_sent, 0);
    }
}
