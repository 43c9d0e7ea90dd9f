//! # Peer Registry
//!
//! Last-known position and endpoint of every peer heard on the discovery
//! channel. Entries are overwritten on every announcement and never removed.

use geochat_core::geo;
use geochat_core::types::{Coordinate, Identity, PeerAddress, PeerDistance, PeerRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Thread-safe map of identity to [`PeerRecord`]
pub struct PeerRegistry {
    /// Our own identity, never stored
    local_identity: Identity,

    /// All peers
    peers: RwLock<HashMap<Identity, PeerRecord>>,

    /// Statistics
    stats: RwLock<PeerRegistryStats>,
}

/// Registry statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerRegistryStats {
    pub known_peers: usize,
    pub total_upserts: u64,
    pub rejected_self: u64,
}

impl PeerRegistry {
    pub fn new(local_identity: impl Into<Identity>) -> Self {
        Self {
            local_identity: local_identity.into(),
            peers: RwLock::new(HashMap::new()),
            stats: RwLock::new(PeerRegistryStats::default()),
        }
    }

    /// Insert or overwrite a peer.
    ///
    /// Returns `true` when the identity was not known before. Records for the
    /// local identity are refused and reported as not new.
    pub fn upsert(&self, identity: &str, coordinate: Coordinate, address: PeerAddress) -> bool {
        if identity == self.local_identity {
            self.stats.write().rejected_self += 1;
            return false;
        }

        let is_new = self
            .peers
            .write()
            .insert(identity.to_string(), PeerRecord::new(coordinate, address))
            .is_none();

        let mut stats = self.stats.write();
        stats.total_upserts += 1;
        stats.known_peers = self.peers.read().len();
        is_new
    }

    pub fn get(&self, identity: &str) -> Option<PeerRecord> {
        self.peers.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.read().contains_key(identity)
    }

    /// Snapshot of every known peer
    pub fn all(&self) -> Vec<(Identity, PeerRecord)> {
        self.peers
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Distance from `local` to a known peer, `None` if unknown
    pub fn distance_to(&self, local: &Coordinate, identity: &str) -> Option<f64> {
        self.peers
            .read()
            .get(identity)
            .map(|record| geo::distance(local, &record.coordinate))
    }

    /// Every peer with its distance from `local`, nearest first
    pub fn distances(&self, local: &Coordinate, radius_m: f64) -> Vec<PeerDistance> {
        let mut list: Vec<PeerDistance> = self
            .peers
            .read()
            .iter()
            .map(|(id, record)| {
                let distance_m = geo::distance(local, &record.coordinate);
                PeerDistance {
                    identity: id.clone(),
                    address: record.address.clone(),
                    distance_m,
                    in_zone: distance_m <= radius_m,
                }
            })
            .collect();

        list.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        list
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn stats(&self) -> PeerRegistryStats {
        self.stats.read().clone()
    }
}
