//! # Node Events
//!
//! Everything the presentation layer needs arrives as a [`NodeEvent`] on a
//! broadcast channel. Chat traffic is also kept in a bounded in-memory
//! history so a front end attaching late can render the conversation.

use std::collections::VecDeque;

use geochat_core::types::{Coordinate, Identity, MessageKind, PeerDistance};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast buffer
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default history length
const HISTORY_CAPACITY: usize = 500;

/// Why a message went to the backlog instead of direct delivery
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason")]
pub enum PendingReason {
    OutOfRange { distance_m: f64 },
    Unreachable { error: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// Distances recomputed by the neighbor monitor, nearest first
    PeerListChanged(Vec<PeerDistance>),

    MessageReceived {
        timestamp: String,
        sender: Identity,
        text: String,
        kind: MessageKind,
    },

    /// Direct delivery acknowledged by the recipient
    MessageSent {
        timestamp: String,
        recipient: Identity,
        text: String,
    },

    /// Message appended to the recipient's backlog
    MessagePending {
        timestamp: String,
        recipient: Identity,
        text: String,
        reason: PendingReason,
    },

    LocationChanged(Coordinate),
}

/// One line of chat history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    /// Sender for received messages, recipient otherwise
    pub peer: Identity,
    pub text: String,
    pub kind: MessageKind,
}

impl HistoryEntry {
    fn from_event(event: &NodeEvent) -> Option<Self> {
        match event {
            NodeEvent::MessageReceived {
                timestamp,
                sender,
                text,
                kind,
            } => Some(Self {
                timestamp: timestamp.clone(),
                peer: sender.clone(),
                text: text.clone(),
                kind: kind.clone(),
            }),
            NodeEvent::MessageSent {
                timestamp,
                recipient,
                text,
            } => Some(Self {
                timestamp: timestamp.clone(),
                peer: recipient.clone(),
                text: text.clone(),
                kind: MessageKind::Sent,
            }),
            NodeEvent::MessagePending {
                timestamp,
                recipient,
                text,
                ..
            } => Some(Self {
                timestamp: timestamp.clone(),
                peer: recipient.clone(),
                text: text.clone(),
                kind: MessageKind::Pending,
            }),
            NodeEvent::PeerListChanged(_) | NodeEvent::LocationChanged(_) => None,
        }
    }
}

/// Fan-out of node events plus chat history
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
    history: RwLock<VecDeque<HistoryEntry>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY, HISTORY_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            tx,
            history: RwLock::new(VecDeque::new()),
            history_capacity,
        }
    }

    /// Record and broadcast. Having no subscribers is not an error.
    pub fn emit(&self, event: NodeEvent) {
        if let Some(entry) = HistoryEntry::from_event(&event) {
            let mut history = self.history.write();
            history.push_back(entry);
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Chat history, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.read().iter().cloned().collect()
    }

    /// History exchanged with one peer
    pub fn conversation(&self, peer: &str) -> Vec<HistoryEntry> {
        self.history
            .read()
            .iter()
            .filter(|entry| entry.peer == peer)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
