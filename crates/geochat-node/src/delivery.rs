//! # Delivery Engine
//!
//! Decides, per message, between direct delivery and the backlog:
//!
//! ```text
//!   unknown recipient ──▶ error, nothing happens
//!   distance ≤ radius ──▶ direct RPC ──ok──▶ Delivered
//!                                    └─fail─▶ Accumulate
//!   distance > radius ──────────────────────▶ Accumulate
//! ```
//!
//! Accumulate appends to the local pending buffer and republishes the whole
//! buffer, retained, on the recipient's backlog topic. The distance check uses
//! whatever coordinate the registry holds; it never waits for a fresh one.
//!
//! Appends and backlog publishes are serialized, so the retained blob is
//! always the latest buffer and never an older snapshot of it.

use std::sync::Arc;
use std::time::Duration;

use geochat_core::geo;
use geochat_core::types::{MessageKind, PeerAddress};
use geochat_core::wire::{
    backlog_topic, parse_backlog, timestamp_now, AccumulatedMessageEnvelope, DirectMessage,
    BACKLOG_TOPIC_PREFIX, ENTRY_DELIMITER,
};
use geochat_network::{DirectDelivery, LocalPeer, PeerRegistry, RpcError, Transport};

use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent, PendingReason};
use crate::metrics::NodeMetrics;
use crate::pending::PendingMessageStore;

/// Delivery tunables
#[derive(Clone, Debug)]
pub struct DeliveryPolicy {
    /// Proximity radius in meters, inclusive
    pub radius_m: f64,
    pub backlog_prefix: String,
    /// Hard deadline on one direct delivery attempt
    pub rpc_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            radius_m: 200.0,
            backlog_prefix: BACKLOG_TOPIC_PREFIX.to_string(),
            rpc_timeout: Duration::from_millis(3000),
        }
    }
}

/// Result of [`DeliveryEngine::send_message`]
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    /// Acknowledged by the recipient over direct RPC
    Delivered,
    /// Appended to the recipient's backlog; `backlog` is the full text now held
    Queued { reason: PendingReason, backlog: String },
}

pub struct DeliveryEngine {
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    pending: Arc<PendingMessageStore>,
    transport: Arc<dyn Transport>,
    rpc: Arc<dyn DirectDelivery>,
    events: Arc<EventBus>,
    metrics: Arc<NodeMetrics>,
    policy: DeliveryPolicy,
    /// Held from append to publish
    backlog_lock: tokio::sync::Mutex<()>,
}

impl DeliveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        pending: Arc<PendingMessageStore>,
        transport: Arc<dyn Transport>,
        rpc: Arc<dyn DirectDelivery>,
        events: Arc<EventBus>,
        metrics: Arc<NodeMetrics>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            local,
            registry,
            pending,
            transport,
            rpc,
            events,
            metrics,
            policy,
            backlog_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Send `text` to `recipient`.
    ///
    /// A failed direct attempt is never retried; it falls through to the
    /// backlog. If the backlog publish itself fails the error is returned
    /// and the entry stays in the local buffer for [`Self::republish_pending`].
    pub async fn send_message(&self, recipient: &str, text: &str) -> Result<SendOutcome> {
        if recipient.trim().is_empty() {
            return Err(NodeError::EmptyRecipient);
        }
        let record = self
            .registry
            .get(recipient)
            .ok_or_else(|| NodeError::UnknownRecipient(recipient.to_string()))?;

        let timestamp = timestamp_now();
        let distance_m = geo::distance(&self.local.coordinate(), &record.coordinate);

        let reason = if distance_m <= self.policy.radius_m {
            let message = DirectMessage::new(self.local.identity(), text, timestamp.clone());
            match self.deliver_direct(&record.address, &message).await {
                Ok(()) => {
                    tracing::info!("Delivered to {} directly ({:.1} m)", recipient, distance_m);
                    self.metrics.direct_deliveries.inc();
                    self.events.emit(NodeEvent::MessageSent {
                        timestamp,
                        recipient: recipient.to_string(),
                        text: text.to_string(),
                    });
                    return Ok(SendOutcome::Delivered);
                }
                Err(e) => {
                    tracing::warn!("Direct delivery to {} failed: {}", recipient, e);
                    self.metrics.delivery_failures.inc();
                    PendingReason::Unreachable { error: e.to_string() }
                }
            }
        } else {
            tracing::info!(
                "{} is out of range ({:.1} m > {:.1} m), queueing",
                recipient,
                distance_m,
                self.policy.radius_m
            );
            PendingReason::OutOfRange { distance_m }
        };

        let backlog = self.accumulate(recipient, text, &timestamp, reason.clone()).await?;
        Ok(SendOutcome::Queued { reason, backlog })
    }

    async fn deliver_direct(
        &self,
        address: &PeerAddress,
        message: &DirectMessage,
    ) -> std::result::Result<(), RpcError> {
        match tokio::time::timeout(self.policy.rpc_timeout, self.rpc.deliver(address, message)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(address.to_string())),
        }
    }

    async fn accumulate(
        &self,
        recipient: &str,
        text: &str,
        timestamp: &str,
        reason: PendingReason,
    ) -> Result<String> {
        let _guard = self.backlog_lock.lock().await;
        let backlog = self.pending.append(recipient, text, timestamp)?;
        self.metrics.accumulated_messages.inc();
        self.events.emit(NodeEvent::MessagePending {
            timestamp: timestamp.to_string(),
            recipient: recipient.to_string(),
            text: text.to_string(),
            reason,
        });

        self.publish_backlog(recipient, &backlog).await?;
        Ok(backlog)
    }

    /// Replace the retained blob on the recipient's backlog topic
    async fn publish_backlog(&self, recipient: &str, text: &str) -> Result<()> {
        let topic = backlog_topic(&self.policy.backlog_prefix, recipient);
        let payload = AccumulatedMessageEnvelope::new(self.local.identity(), text).encode()?;

        tracing::debug!("Publishing backlog for {} on '{}' ({} bytes)", recipient, topic, payload.len());
        self.transport.publish(&topic, payload, true).await?;
        Ok(())
    }

    /// Publish the current pending text again without changing it.
    ///
    /// Returns `false` when nothing is pending for `recipient`.
    pub async fn republish_pending(&self, recipient: &str) -> Result<bool> {
        let _guard = self.backlog_lock.lock().await;
        match self.pending.get(recipient) {
            Some(text) => {
                self.publish_backlog(recipient, &text).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forget what is pending for `recipient`.
    ///
    /// Only the local buffer is dropped. The retained blob is shared with
    /// other senders to the same recipient and is left on the broker.
    pub fn clear_pending(&self, recipient: &str) -> Option<String> {
        let cleared = self.pending.clear(recipient);
        if cleared.is_some() {
            tracing::info!("Cleared pending messages for {}", recipient);
        }
        cleared
    }

    /// Re-deliver what is pending for `recipient` over direct RPC, oldest
    /// first, tagged `was-pending`.
    ///
    /// Stops at the first failed attempt. Acknowledged entries leave the
    /// local buffer; the rest stay queued. The retained blob is not touched,
    /// the recipient skips entries it already received. Returns how many
    /// entries were acknowledged.
    pub async fn flush_pending(&self, recipient: &str) -> usize {
        let (Some(record), Some(text)) = (self.registry.get(recipient), self.pending.get(recipient))
        else {
            return 0;
        };

        // Lines consumed from the front of the buffer, blank ones included
        let mut consumed = 0;
        let mut delivered = 0;
        for line in text.split(ENTRY_DELIMITER) {
            let Some(entry) = parse_backlog(line).pop() else {
                consumed += 1;
                continue;
            };
            let mut message =
                DirectMessage::new(self.local.identity(), entry.message.clone(), entry.timestamp.clone());
            message.kind = Some(MessageKind::WasPending);

            if let Err(e) = self.deliver_direct(&record.address, &message).await {
                tracing::warn!("Flushing pending messages to {} stopped: {}", recipient, e);
                self.metrics.delivery_failures.inc();
                break;
            }
            consumed += 1;
            delivered += 1;
            self.metrics.direct_deliveries.inc();
            self.events.emit(NodeEvent::MessageSent {
                timestamp: entry.timestamp,
                recipient: recipient.to_string(),
                text: entry.message,
            });
        }

        if consumed > 0 {
            let _guard = self.backlog_lock.lock().await;
            let left = self.pending.drain_front(recipient, consumed);
            tracing::info!(
                "Flushed {} pending message(s) to {} ({} left)",
                delivered,
                recipient,
                left.map(|text| text.split(ENTRY_DELIMITER).count()).unwrap_or(0)
            );
        }
        delivered
    }

    pub fn pending(&self) -> &PendingMessageStore {
        &self.pending
    }
}
