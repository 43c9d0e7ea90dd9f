//! # MQTT Transport
//!
//! [`Transport`] over an external MQTT broker using `rumqttc`.
//!
//! The rumqttc event loop must be polled continuously for anything to move,
//! so [`MqttTransport::connect`] waits for the broker's CONNACK and then hands
//! the loop to a background task that forwards inbound publishes.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::transport::{Transport, TransportMessage};

/// MQTT connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// How long to wait for CONNACK before giving up
    pub connect_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            client_id: format!("geochat-{}", uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// MQTT-backed transport
pub struct MqttTransport {
    client: AsyncClient,
    event_task: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect to the broker.
    ///
    /// Fails with [`TransportError::Unavailable`] when no CONNACK arrives
    /// within the configured timeout.
    pub async fn connect(
        config: &MqttConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportMessage>), TransportError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| {
                TransportError::Unavailable(format!(
                    "no CONNACK from {}:{} within {:?}",
                    config.host, config.port, config.connect_timeout
                ))
            })??;

        tracing::info!("Connected to MQTT broker at {}:{}", config.host, config.port);

        let (tx, rx) = mpsc::unbounded_channel();
        let event_task = tokio::spawn(run_event_loop(event_loop, tx));

        Ok((Self { client, event_task }, rx))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(TransportError::Unavailable(e.to_string())),
        }
    }
}

async fn run_event_loop(mut event_loop: EventLoop, tx: mpsc::UnboundedSender<TransportMessage>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = TransportMessage::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    publish.retain,
                );
                if tx.send(msg).is_err() {
                    tracing::debug!("MQTT receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc reconnects on the next poll
                tracing::warn!("MQTT connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MqttConfig::default();
        assert_eq!(config.port, 1883);
        assert!(config.client_id.starts_with("geochat-"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let result = MqttTransport::connect(&config).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
