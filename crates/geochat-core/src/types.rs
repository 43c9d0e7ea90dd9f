//! Core type definitions for GeoChat
//!
//! Identities are plain strings chosen by the user; they are the primary key
//! for everything a node knows about its peers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Peer identity (user-chosen, process-unique name)
pub type Identity = String;

/// Geographic position in signed decimal degrees
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Create a coordinate, rejecting values outside [-90, 90] / [-180, 180]
    pub fn checked(latitude: f64, longitude: f64) -> Result<Self> {
        let coord = Self::new(latitude, longitude);
        if coord.is_valid() {
            Ok(coord)
        } else {
            Err(ProtocolError::InvalidCoordinate {
                latitude,
                longitude,
            })
        }
    }

    /// Check the coordinate is finite and within range
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Reachable endpoint for direct delivery
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the peer's JSON-RPC endpoint
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Last-known state of a remote peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Last announced position
    pub coordinate: Coordinate,

    /// Direct-delivery endpoint
    pub address: PeerAddress,

    /// Unix timestamp of the announcement that produced this record
    pub last_seen: i64,
}

impl PeerRecord {
    pub fn new(coordinate: Coordinate, address: PeerAddress) -> Self {
        Self {
            coordinate,
            address,
            last_seen: chrono::Utc::now().timestamp(),
        }
    }
}

/// Advisory tag describing how a message reached the presentation layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Delivered over direct RPC
    #[default]
    Direct,
    /// Surfaced from an accumulated backlog
    WasPending,
    /// Echo of a message this node sent
    Sent,
    /// Queued locally because the recipient was out of range or unreachable
    Pending,
    /// Any tag this node does not recognise
    #[serde(untagged)]
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::WasPending => "was-pending",
            Self::Sent => "sent",
            Self::Pending => "pending",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer and how far it is from the local node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDistance {
    pub identity: Identity,
    pub address: PeerAddress,
    pub distance_m: f64,
    pub in_zone: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::checked(40.0, -8.0).is_ok());
        assert!(Coordinate::checked(90.5, 0.0).is_err());
        assert!(Coordinate::checked(0.0, f64::NAN).is_err());
    }

    #[test]
    fn test_rpc_url() {
        let addr = PeerAddress::new("192.168.1.20", 8042);
        assert_eq!(addr.rpc_url(), "http://192.168.1.20:8042/");
        assert_eq!(addr.to_string(), "192.168.1.20:8042");
    }

    #[test]
    fn test_message_kind_tags() {
        let json = serde_json::to_string(&MessageKind::WasPending).unwrap();
        assert_eq!(json, "\"was-pending\"");

        let kind: MessageKind = serde_json::from_str("\"direct\"").unwrap();
        assert_eq!(kind, MessageKind::Direct);

        let kind: MessageKind = serde_json::from_str("\"broadcast\"").unwrap();
        assert_eq!(kind, MessageKind::Other("broadcast".to_string()));
    }
}
