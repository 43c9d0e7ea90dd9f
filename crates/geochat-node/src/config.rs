//! Node configuration types

use std::path::Path;
use std::time::Duration;

use geochat_core::types::Coordinate;
use geochat_core::wire::{BACKLOG_TOPIC_PREFIX, DISCOVERY_TOPIC};
use geochat_network::RpcConfig;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity and starting position
    #[serde(default)]
    pub node: NodeSettings,

    /// Pub/sub broker
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Direct-delivery RPC endpoint
    #[serde(default)]
    pub rpc: RpcSettings,

    /// Delivery policy
    #[serde(default)]
    pub delivery: DeliverySettings,

    /// Neighbor monitor
    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl NodeConfig {
    /// Load from a TOML file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| NodeError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node.identity.trim().is_empty() {
            return Err(NodeError::Config("node.identity must not be empty".to_string()));
        }
        if self.node.identity.contains(['/', '+', '#']) {
            return Err(NodeError::Config(format!(
                "node.identity '{}' must not contain topic separators or wildcards",
                self.node.identity
            )));
        }
        Coordinate::checked(self.node.latitude, self.node.longitude)?;
        if self.delivery.radius_m.is_nan() || self.delivery.radius_m <= 0.0 {
            return Err(NodeError::Config(format!(
                "delivery.radius_m must be positive, got {}",
                self.delivery.radius_m
            )));
        }
        if self.monitor.interval_secs == 0 {
            return Err(NodeError::Config("monitor.interval_secs must be non-zero".to_string()));
        }
        if self.rpc.request_timeout_ms == 0 {
            return Err(NodeError::Config("rpc.request_timeout_ms must be non-zero".to_string()));
        }
        if self.broker.discovery_topic.is_empty() || self.broker.backlog_prefix.is_empty() {
            return Err(NodeError::Config("broker topics must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.node.latitude, self.node.longitude)
    }

    /// Runtime RPC settings
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            bind_address: self.rpc.bind_address.clone(),
            port: self.rpc.port,
            advertise_ip: self.rpc.advertise_ip.clone(),
            request_timeout: Duration::from_millis(self.rpc.request_timeout_ms),
        }
    }
}

/// Identity and starting position
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Unique name on the network
    #[serde(default)]
    pub identity: String,

    #[serde(default)]
    pub latitude: f64,

    #[serde(default)]
    pub longitude: f64,
}

/// Which transport to connect
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// External MQTT broker
    #[default]
    Mqtt,
    /// In-process broker, single-process use only
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub kind: BrokerKind,

    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_discovery_topic")]
    pub discovery_topic: String,

    /// Backlog topics are `<prefix>/<identity>`
    #[serde(default = "default_backlog_prefix")]
    pub backlog_prefix: String,
}

fn default_broker_host() -> String {
    "test.mosquitto.org".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_discovery_topic() -> String {
    DISCOVERY_TOPIC.to_string()
}

fn default_backlog_prefix() -> String {
    BACKLOG_TOPIC_PREFIX.to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_secs: default_keep_alive_secs(),
            discovery_topic: default_discovery_topic(),
            backlog_prefix: default_backlog_prefix(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listen port, advertised in announcements
    #[serde(default = "default_rpc_port")]
    pub port: u16,

    /// Advertised IP; detected when unset
    #[serde(default)]
    pub advertise_ip: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    8000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_rpc_port(),
            advertise_ip: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Proximity radius in meters
    #[serde(default = "default_radius_m")]
    pub radius_m: f64,

    /// Re-announce on first sight of a new peer
    #[serde(default = "default_true")]
    pub reply_to_new_peers: bool,

    /// Re-send pending messages directly once their recipient is back in zone
    #[serde(default)]
    pub flush_on_reentry: bool,
}

fn default_radius_m() -> f64 {
    200.0
}

fn default_true() -> bool {
    true
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            radius_m: default_radius_m(),
            reply_to_new_peers: true,
            flush_on_reentry: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How long the backlog subscription stays open on a pull
    #[serde(default = "default_pull_grace_ms")]
    pub pull_grace_ms: u64,

    /// Pull the backlog once at startup regardless of neighbors
    #[serde(default)]
    pub pull_on_start: bool,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_pull_grace_ms() -> u64 {
    2000
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            pull_grace_ms: default_pull_grace_ms(),
            pull_on_start: false,
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn pull_grace(&self) -> Duration {
        Duration::from_millis(self.pull_grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9615".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.identity = "A".to_string();
        config.node.latitude = 40.0;
        config.node.longitude = -8.0;
        config
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.delivery.radius_m, 200.0);
        assert_eq!(config.broker.discovery_topic, "users/online");
        assert_eq!(config.broker.backlog_prefix, "messages");
        assert_eq!(config.monitor.interval(), Duration::from_secs(30));
        assert_eq!(config.monitor.pull_grace(), Duration::from_secs(2));
        assert!(config.delivery.reply_to_new_peers);
        assert!(!config.delivery.flush_on_reentry);
    }

    #[test]
    fn test_partial_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            [node]
            identity = "B"
            latitude = 40.0
            longitude = -8.001

            [delivery]
            radius_m = 500.0
            "#,
        )
        .unwrap();

        assert_eq!(config.node.identity, "B");
        assert_eq!(config.delivery.radius_m, 500.0);
        assert_eq!(config.rpc.port, 8000);
        assert_eq!(config.broker.kind, BrokerKind::Mqtt);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut config = valid();
        config.broker.kind = BrokerKind::Memory;
        config.rpc.advertise_ip = Some("10.0.0.1".to_string());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.node.identity, "A");
        assert_eq!(loaded.broker.kind, BrokerKind::Memory);
        assert_eq!(loaded.rpc.advertise_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_validate_rejects() {
        assert!(NodeConfig::default().validate().is_err());

        let mut config = valid();
        config.node.identity = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.node.latitude = 95.0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.delivery.radius_m = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.monitor.interval_secs = 0;
        assert!(config.validate().is_err());

        valid().validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = NodeConfig::from_file("/nonexistent/geochat.toml").unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }
}
