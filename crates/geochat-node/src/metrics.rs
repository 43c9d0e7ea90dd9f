//! Prometheus metrics and the `/metrics` endpoint

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Node counters, each registered under the `geochat_` prefix
pub struct NodeMetrics {
    registry: Registry,
    pub direct_deliveries: IntCounter,
    pub delivery_failures: IntCounter,
    pub accumulated_messages: IntCounter,
    pub messages_received: IntCounter,
    pub backlog_entries_received: IntCounter,
    pub invalid_announcements: IntCounter,
    pub backlog_pulls: IntCounter,
    pub known_peers: IntGauge,
    pub peers_in_zone: IntGauge,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let direct_deliveries = IntCounter::new(
            "geochat_direct_deliveries_total",
            "Messages acknowledged over direct RPC",
        )?;
        let delivery_failures = IntCounter::new(
            "geochat_delivery_failures_total",
            "Direct RPC attempts that failed or timed out",
        )?;
        let accumulated_messages = IntCounter::new(
            "geochat_accumulated_messages_total",
            "Messages appended to a recipient backlog",
        )?;
        let messages_received = IntCounter::new(
            "geochat_messages_received_total",
            "Messages received over direct RPC",
        )?;
        let backlog_entries_received = IntCounter::new(
            "geochat_backlog_entries_received_total",
            "Backlog entries surfaced from pulls",
        )?;
        let invalid_announcements = IntCounter::new(
            "geochat_invalid_announcements_total",
            "Discovery messages dropped as malformed",
        )?;
        let backlog_pulls = IntCounter::new("geochat_backlog_pulls_total", "Backlog pulls performed")?;
        let known_peers = IntGauge::new("geochat_known_peers", "Peers in the registry")?;
        let peers_in_zone = IntGauge::new("geochat_peers_in_zone", "Peers within the proximity radius")?;

        registry.register(Box::new(direct_deliveries.clone()))?;
        registry.register(Box::new(delivery_failures.clone()))?;
        registry.register(Box::new(accumulated_messages.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(backlog_entries_received.clone()))?;
        registry.register(Box::new(invalid_announcements.clone()))?;
        registry.register(Box::new(backlog_pulls.clone()))?;
        registry.register(Box::new(known_peers.clone()))?;
        registry.register(Box::new(peers_in_zone.clone()))?;

        Ok(Self {
            registry,
            direct_deliveries,
            delivery_failures,
            accumulated_messages,
            messages_received,
            backlog_entries_received,
            invalid_announcements,
            backlog_pulls,
            known_peers,
            peers_in_zone,
        })
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Serves `/metrics` and `/health`
pub struct MetricsServer {
    address: String,
    metrics: Arc<NodeMetrics>,
}

impl MetricsServer {
    pub fn new(address: impl Into<String>, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            address: address.into(),
            metrics,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        tracing::info!("Metrics server listening on {}", listener.local_addr()?);

        loop {
            let (mut stream, _) = listener.accept().await?;
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let n = match stream.read(&mut buf).await {
                    Ok(n) => n,
                    Err(_) => return,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = respond(&request, &metrics);
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}

fn respond(request: &str, metrics: &NodeMetrics) -> String {
    if request.starts_with("GET /metrics") {
        match metrics.encode() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            ),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        }
    } else if request.starts_with("GET /health") {
        let body = r#"{"status":"healthy"}"#;
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.direct_deliveries.inc();
        metrics.known_peers.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("geochat_direct_deliveries_total 1"));
        assert!(text.contains("geochat_known_peers 3"));
    }

    #[test]
    fn test_routes() {
        let metrics = NodeMetrics::new().unwrap();
        assert!(respond("GET /health HTTP/1.1\r\n\r\n", &metrics).contains("healthy"));
        assert!(respond("GET /metrics HTTP/1.1\r\n\r\n", &metrics).starts_with("HTTP/1.1 200"));
        assert!(respond("GET / HTTP/1.1\r\n\r\n", &metrics).starts_with("HTTP/1.1 404"));
    }
}
