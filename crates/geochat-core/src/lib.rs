//! # GeoChat Core
//!
//! Core data structures for the GeoChat proximity messaging protocol.
//!
//! This crate provides the building blocks shared by every other crate:
//! - `Coordinate` / `PeerAddress` / `PeerRecord` - what a node knows about a peer
//! - `geo::distance` - the flat-earth distance used for proximity gating
//! - `wire` - the JSON payloads exchanged on the discovery and backlog channels,
//!   and the direct-delivery call body
//!
//! ## Channels
//!
//! | Channel | Topic | Payload | Retained |
//! |---------|-------|---------|----------|
//! | Discovery | `users/online` | `DiscoveryAnnouncement` | yes |
//! | Backlog | `messages/<identity>` | `AccumulatedMessageEnvelope` | yes, full replace |
//! | Direct | JSON-RPC `receiveMessage` | `DirectMessage` | n/a |

pub mod error;
pub mod geo;
pub mod types;
pub mod wire;

pub use error::*;
pub use geo::{distance, METERS_PER_DEGREE};
pub use types::*;
pub use wire::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ProtocolError, Result};
    pub use crate::geo::distance;
    pub use crate::types::{Coordinate, MessageKind, PeerAddress, PeerRecord};
    pub use crate::wire::{AccumulatedMessageEnvelope, DirectMessage, DiscoveryAnnouncement};
}
