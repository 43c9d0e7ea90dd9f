//! Shared helpers for multi-node tests

use std::sync::Arc;
use std::time::Duration;

use geochat_network::{JsonRpcClient, MemoryBroker};
use geochat_node::config::BrokerKind;
use geochat_node::{GeoChatNode, NodeConfig};

pub fn node_config(identity: &str, latitude: f64, longitude: f64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.identity = identity.to_string();
    config.node.latitude = latitude;
    config.node.longitude = longitude;
    config.broker.kind = BrokerKind::Memory;
    config.rpc.bind_address = "127.0.0.1".to_string();
    config.rpc.port = 0;
    config.rpc.advertise_ip = Some("127.0.0.1".to_string());
    config.rpc.request_timeout_ms = 2000;
    // Periodic ticks stay out of the way; tests call refresh_neighbors
    config.monitor.interval_secs = 3600;
    config.monitor.pull_grace_ms = 300;
    config
}

pub async fn spawn_node(broker: &MemoryBroker, config: NodeConfig) -> GeoChatNode {
    let (transport, rx) = broker.connect(config.node.identity.clone()).unwrap();
    let rpc = Arc::new(JsonRpcClient::new(Duration::from_millis(config.rpc.request_timeout_ms)).unwrap());
    GeoChatNode::start(config, Arc::new(transport), rx, rpc).await.unwrap()
}

/// Poll `condition` every 20 ms for up to 5 s
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn knows(node: &GeoChatNode, peer: &str) -> bool {
    node.peers().iter().any(|p| p.identity == peer)
}
