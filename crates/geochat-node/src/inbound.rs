//! # Inbound Messages
//!
//! Two ways a message reaches this node:
//! - direct `receiveMessage` calls from the RPC server
//! - backlog blobs published on our own backlog topic and picked up by a pull
//!
//! A sender's blob is retained on the broker until that sender clears it, so
//! every pull replays it in full. The handler remembers the entries it has
//! already surfaced per sender and, when a blob extends the previous one,
//! only surfaces the new suffix. An older snapshot of a blob already seen
//! surfaces nothing.
//!
//! A sender flushing its backlog over RPC tags each message `was-pending`.
//! Those count as seen too, so a message arriving both ways surfaces once.

use std::collections::HashMap;
use std::sync::Arc;

use geochat_core::error::ProtocolError;
use geochat_core::types::{Identity, MessageKind};
use geochat_core::wire::{AccumulatedMessageEnvelope, BacklogEntry, DirectMessage};
use geochat_network::MessageSink;
use parking_lot::Mutex;

use crate::events::{EventBus, NodeEvent};
use crate::metrics::NodeMetrics;

pub struct InboundMessageHandler {
    events: Arc<EventBus>,
    metrics: Arc<NodeMetrics>,
    /// Entries already surfaced, per sender
    seen: Mutex<HashMap<Identity, Vec<BacklogEntry>>>,
}

impl InboundMessageHandler {
    pub fn new(events: Arc<EventBus>, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            events,
            metrics,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a payload from our backlog topic.
    ///
    /// Returns how many entries were surfaced. An empty payload is a blob
    /// cleared upstream and surfaces nothing.
    pub fn on_backlog_message(&self, raw: &[u8]) -> Result<usize, ProtocolError> {
        if raw.is_empty() {
            tracing::debug!("Backlog cleared upstream");
            return Ok(0);
        }

        let envelope = AccumulatedMessageEnvelope::decode(raw)?;
        let entries = envelope.entries();

        let fresh: Vec<BacklogEntry> = {
            let mut seen = self.seen.lock();
            let previous = seen.entry(envelope.sender.clone()).or_default();
            if entries.starts_with(previous.as_slice()) {
                let fresh = entries[previous.len()..].to_vec();
                *previous = entries;
                fresh
            } else if previous.starts_with(entries.as_slice()) {
                Vec::new()
            } else {
                *previous = entries.clone();
                entries
            }
        };

        if fresh.is_empty() {
            tracing::trace!("Backlog from {} has nothing new", envelope.sender);
            return Ok(0);
        }

        tracing::info!(
            "Surfacing {} pending message(s) from {}",
            fresh.len(),
            envelope.sender
        );

        for entry in &fresh {
            self.events.emit(NodeEvent::MessageReceived {
                timestamp: entry.timestamp.clone(),
                sender: envelope.sender.clone(),
                text: entry.message.clone(),
                kind: MessageKind::WasPending,
            });
        }
        self.metrics.backlog_entries_received.inc_by(fresh.len() as u64);

        Ok(fresh.len())
    }

    /// Forget what was surfaced for `sender`
    pub fn reset_sender(&self, sender: &str) {
        self.seen.lock().remove(sender);
    }
}

impl MessageSink for InboundMessageHandler {
    fn receive_message(&self, message: DirectMessage) -> bool {
        tracing::info!("Message from {} at {}", message.sender, message.timestamp);
        self.metrics.messages_received.inc();

        if message.kind == Some(MessageKind::WasPending) {
            let entry = BacklogEntry {
                timestamp: message.timestamp.clone(),
                message: message.message.clone(),
            };
            let mut seen = self.seen.lock();
            let previous = seen.entry(message.sender.clone()).or_default();
            if previous.contains(&entry) {
                tracing::debug!("Already surfaced a pending message from {}", message.sender);
                return true;
            }
            previous.push(entry);
        }

        self.events.emit(NodeEvent::MessageReceived {
            timestamp: message.timestamp,
            sender: message.sender,
            text: message.message,
            kind: message.kind.unwrap_or_default(),
        });
        true
    }
}
