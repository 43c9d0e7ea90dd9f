//! # GeoChat Node
//!
//! Proximity-gated messaging node. Peers closer than the proximity radius
//! get messages over direct RPC; everyone else, and anyone whose RPC call
//! fails, gets them through a retained backlog topic that the recipient pulls
//! once a neighbor is in range.
//!
//! ```text
//! ┌──────────────┐  send_message  ┌──────────────────┐   receiveMessage   ┌──────────┐
//! │ presentation │───────────────▶│  DeliveryEngine  │───────────────────▶│   peer   │
//! │  (NodeEvent) │                └────────┬─────────┘                    └──────────┘
//! └──────▲───────┘                         │ out of range / unreachable
//!        │                                 ▼
//!        │                      messages/<recipient> (retained)
//!        │                                 │
//!        │  was-pending   ┌────────────────┴──────┐  pull when a peer is in zone
//!        └────────────────│ InboundMessageHandler │◀──────── NeighborMonitor
//!                         └───────────────────────┘
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod inbound;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod pending;

pub use config::{BrokerKind, NodeConfig};
pub use delivery::{DeliveryEngine, DeliveryPolicy, SendOutcome};
pub use error::{NodeError, Result};
pub use events::{EventBus, HistoryEntry, NodeEvent, PendingReason};
pub use inbound::InboundMessageHandler;
pub use metrics::{MetricsServer, NodeMetrics};
pub use monitor::{MonitorConfig, NeighborMonitor, TickReport};
pub use node::{connect_transport, shutdown_signal, GeoChatNode, InboundReceiver, NodeState};
pub use pending::PendingMessageStore;
