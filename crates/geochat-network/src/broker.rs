//! # In-Memory Broker
//!
//! In-process pub/sub broker with MQTT retain semantics:
//! - a retained publish replaces the topic's retained value
//! - an empty retained payload clears it
//! - subscribing replays every matching retained value to the new subscriber
//! - publishers receive their own publishes if subscribed
//!
//! Several nodes in one process (or one test) share a `MemoryBroker` and each
//! connect their own [`MemoryTransport`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{topic_matches, Transport, TransportMessage};

/// Per-client subscription state
struct ClientEntry {
    filters: HashSet<String>,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    retained: HashMap<String, Vec<u8>>,
    clients: HashMap<String, ClientEntry>,
    publish_count: u64,
}

/// Shared in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            })),
        }
    }

    /// Connect a client; inbound publishes arrive on the returned receiver
    pub fn connect(
        &self,
        client_id: impl Into<String>,
    ) -> Result<(MemoryTransport, mpsc::UnboundedReceiver<TransportMessage>), TransportError> {
        let client_id = client_id.into();
        let mut state = self.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable(format!(
                "memory broker refused connection from {client_id}"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(
            client_id.clone(),
            ClientEntry {
                filters: HashSet::new(),
                sender: tx,
            },
        );
        tracing::debug!(client = %client_id, "memory broker client connected");

        Ok((
            MemoryTransport {
                broker: self.clone(),
                client_id,
            },
            rx,
        ))
    }

    /// Simulate the broker going down or coming back
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Current retained value on `topic`
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Total publishes accepted since creation
    pub fn publish_count(&self) -> u64 {
        self.state.lock().publish_count
    }

    /// Whether `client_id` currently holds a filter equal to `topic`
    pub fn is_subscribed(&self, client_id: &str, topic: &str) -> bool {
        self.state
            .lock()
            .clients
            .get(client_id)
            .map(|c| c.filters.contains(topic))
            .unwrap_or(false)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable("memory broker is down".to_string()));
        }
        state.publish_count += 1;

        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }

        let mut gone = Vec::new();
        for (id, client) in state.clients.iter() {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                let msg = TransportMessage::new(topic, payload.clone(), false);
                if client.sender.send(msg).is_err() {
                    gone.push(id.clone());
                }
            }
        }
        for id in gone {
            state.clients.remove(&id);
        }
        Ok(())
    }

    fn subscribe(&self, client_id: &str, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable("memory broker is down".to_string()));
        }

        let replay: Vec<TransportMessage> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| TransportMessage::new(topic.clone(), payload.clone(), true))
            .collect();

        let client = state.clients.get_mut(client_id).ok_or(TransportError::Closed)?;
        client.filters.insert(filter.to_string());
        for msg in replay {
            if client.sender.send(msg).is_err() {
                return Err(TransportError::Closed);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let client = state.clients.get_mut(client_id).ok_or(TransportError::Closed)?;
        client.filters.remove(filter);
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's handle on a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.broker.publish(topic, payload, retain)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.subscribe(&self.client_id, topic)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.unsubscribe(&self.client_id, topic)
    }
}
