//! # GeoChat Network Layer
//!
//! Everything that crosses a process boundary.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     GEOCHAT NETWORK LAYER                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Presence   │  │     Peer     │  │   JSON-RPC   │          │
//! │  │  Broadcast / │─▶│   Registry   │  │ client/server│          │
//! │  │   Listener   │  │              │  │  (direct)    │          │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘          │
//! │         │                                                       │
//! │  ┌──────┴───────────────────────────────┐                       │
//! │  │     Transport (pub/sub + retain)     │                       │
//! │  │   MemoryBroker  |  MQTT (feature)    │                       │
//! │  └──────────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod broker;
pub mod discovery;
pub mod error;
pub mod local_ip;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod peer;
pub mod rpc;
pub mod transport;

// Re-exports
pub use broker::{MemoryBroker, MemoryTransport};
pub use discovery::{ListenerOutcome, LocalPeer, PresenceBroadcaster, PresenceListener};
pub use error::{RpcError, TransportError};
pub use local_ip::detect_local_ip;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttTransport};
pub use peer::PeerRegistry;
pub use rpc::{DirectDelivery, JsonRpcClient, MessageSink, RpcConfig, RpcServer};
pub use transport::{Transport, TransportMessage};
