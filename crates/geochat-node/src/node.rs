//! GeoChat node
//!
//! Wires the registry, pending store, presence, delivery engine, inbound
//! handler and neighbor monitor together and runs three background tasks:
//! - dispatch: drains the transport's inbound publishes and routes them by topic
//! - RPC server: serves `receiveMessage`, one task per connection
//! - monitor: periodic distance evaluation and backlog pulls

use std::net::SocketAddr;
use std::sync::Arc;

use geochat_core::types::{Coordinate, PeerAddress, PeerDistance};
use geochat_core::wire::backlog_topic;
use geochat_network::{
    detect_local_ip, DirectDelivery, ListenerOutcome, LocalPeer, MemoryBroker, PeerRegistry,
    PresenceBroadcaster, PresenceListener, RpcServer, Transport, TransportMessage,
};
use parking_lot::{Mutex, RwLock};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{BrokerKind, BrokerSettings, NodeConfig};
use crate::delivery::{DeliveryEngine, DeliveryPolicy, SendOutcome};
use crate::error::Result;
use crate::events::{EventBus, HistoryEntry, NodeEvent};
use crate::inbound::InboundMessageHandler;
use crate::metrics::{MetricsServer, NodeMetrics};
use crate::monitor::{MonitorConfig, NeighborMonitor, TickReport};
use crate::pending::PendingMessageStore;

/// Node state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Inbound side of a transport connection
pub type InboundReceiver = mpsc::UnboundedReceiver<TransportMessage>;

/// Connect the transport named by the `[broker]` section.
///
/// A memory broker created here is private to this node and only useful for
/// trying the node out alone; tests share one [`MemoryBroker`] instead.
pub async fn connect_transport(
    settings: &BrokerSettings,
    client_id: &str,
) -> Result<(Arc<dyn Transport>, InboundReceiver)> {
    match settings.kind {
        BrokerKind::Memory => {
            let (transport, rx) = MemoryBroker::new().connect(client_id)?;
            Ok((Arc::new(transport), rx))
        }
        #[cfg(feature = "mqtt")]
        BrokerKind::Mqtt => {
            let config = geochat_network::MqttConfig {
                host: settings.host.clone(),
                port: settings.port,
                keep_alive: std::time::Duration::from_secs(settings.keep_alive_secs),
                ..Default::default()
            };
            let (transport, rx) = geochat_network::MqttTransport::connect(&config).await?;
            Ok((Arc::new(transport), rx))
        }
        #[cfg(not(feature = "mqtt"))]
        BrokerKind::Mqtt => Err(crate::error::NodeError::Config(
            "built without MQTT support; enable the `mqtt` feature or use broker.kind = \"memory\""
                .to_string(),
        )),
    }
}

/// A running GeoChat node
pub struct GeoChatNode {
    config: NodeConfig,
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<NodeMetrics>,
    broadcaster: Arc<PresenceBroadcaster>,
    engine: Arc<DeliveryEngine>,
    monitor: Arc<NeighborMonitor>,
    rpc_addr: SocketAddr,
    state: Arc<RwLock<NodeState>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GeoChatNode {
    /// Start a node on an already connected transport.
    ///
    /// Fails if the configuration is invalid, the RPC port cannot be bound,
    /// or the transport rejects the discovery subscription or the first
    /// announcement.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        inbound_rx: InboundReceiver,
        rpc: Arc<dyn DirectDelivery>,
    ) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(RwLock::new(NodeState::Starting));
        let identity = config.node.identity.clone();

        let metrics = Arc::new(NodeMetrics::new()?);
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(PeerRegistry::new(identity.clone()));
        let pending = Arc::new(PendingMessageStore::new());
        let inbound = Arc::new(InboundMessageHandler::new(events.clone(), metrics.clone()));

        // RPC endpoint first so the real port is known before announcing
        let rpc_config = config.rpc_config();
        let server = RpcServer::bind(&rpc_config.listen_addr(), inbound.clone()).await?;
        let rpc_addr = server.local_addr()?;
        let advertised_ip = match &rpc_config.advertise_ip {
            Some(ip) => ip.clone(),
            None => detect_local_ip().await.to_string(),
        };

        let local = Arc::new(LocalPeer::new(
            identity.clone(),
            config.coordinate(),
            PeerAddress::new(advertised_ip, rpc_addr.port()),
        ));

        let broadcaster = Arc::new(PresenceBroadcaster::new(
            local.clone(),
            transport.clone(),
            config.broker.discovery_topic.clone(),
        ));
        let listener = Arc::new(PresenceListener::new(
            registry.clone(),
            broadcaster.clone(),
            config.delivery.reply_to_new_peers,
        ));

        let own_backlog = backlog_topic(&config.broker.backlog_prefix, &identity);
        let engine = Arc::new(DeliveryEngine::new(
            local.clone(),
            registry.clone(),
            pending,
            transport.clone(),
            rpc,
            events.clone(),
            metrics.clone(),
            DeliveryPolicy {
                radius_m: config.delivery.radius_m,
                backlog_prefix: config.broker.backlog_prefix.clone(),
                rpc_timeout: rpc_config.request_timeout,
            },
        ));
        let mut monitor = NeighborMonitor::new(
            local.clone(),
            registry.clone(),
            transport.clone(),
            events.clone(),
            metrics.clone(),
            MonitorConfig {
                interval: config.monitor.interval(),
                pull_grace: config.monitor.pull_grace(),
                radius_m: config.delivery.radius_m,
                backlog_topic: own_backlog.clone(),
                pull_on_start: config.monitor.pull_on_start,
            },
        );
        if config.delivery.flush_on_reentry {
            monitor = monitor.with_pending_flush(engine.clone());
        }
        let monitor = Arc::new(monitor);

        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks = Vec::new();

        tasks.push(spawn_dispatch(
            inbound_rx,
            Router {
                discovery_topic: config.broker.discovery_topic.clone(),
                backlog_topic: own_backlog,
                listener,
                inbound,
                metrics: metrics.clone(),
            },
            shutdown_tx.subscribe(),
        ));
        tasks.push(spawn_rpc_server(server, shutdown_tx.subscribe()));

        let node = Self {
            config,
            local,
            registry,
            events,
            metrics,
            broadcaster,
            engine,
            monitor,
            rpc_addr,
            state,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        };

        transport.subscribe(&node.config.broker.discovery_topic).await?;
        node.broadcaster.announce().await?;

        let monitor = node.monitor.clone();
        let shutdown_rx = node.shutdown_tx.subscribe();
        node.tasks
            .lock()
            .push(tokio::spawn(async move { monitor.run(shutdown_rx).await }));

        if node.config.metrics.enabled {
            node.tasks.lock().push(spawn_metrics_server(
                MetricsServer::new(node.config.metrics.address.clone(), node.metrics.clone()),
                node.shutdown_tx.subscribe(),
            ));
        }

        *node.state.write() = NodeState::Running;
        node.print_banner();
        Ok(node)
    }

    fn print_banner(&self) {
        tracing::info!("╔═══════════════════════════════════════════════╗");
        tracing::info!("║              GeoChat node running              ║");
        tracing::info!("╚═══════════════════════════════════════════════╝");
        tracing::info!("Identity:     {}", self.local.identity());
        tracing::info!("Position:     {}", self.local.coordinate());
        tracing::info!("RPC:          {} (advertised {})", self.rpc_addr, self.local.address());
        tracing::info!("Radius:       {} m", self.config.delivery.radius_m);
        tracing::info!("Discovery:    {}", self.config.broker.discovery_topic);
    }

    /// Send a chat message, directly if possible, otherwise via the backlog
    pub async fn send_message(&self, recipient: &str, text: &str) -> Result<SendOutcome> {
        self.engine.send_message(recipient, text).await
    }

    /// Move this node and re-announce
    pub async fn update_location(&self, latitude: f64, longitude: f64) -> Result<()> {
        let coordinate = Coordinate::checked(latitude, longitude)?;
        self.local.set_coordinate(coordinate);
        tracing::info!("Location updated to {}", coordinate);
        self.events.emit(NodeEvent::LocationChanged(coordinate));
        self.broadcaster.announce().await?;
        Ok(())
    }

    /// Run a monitor tick now
    pub async fn refresh_neighbors(&self) -> TickReport {
        self.monitor.tick().await
    }

    /// Re-send the current backlog blob for `recipient`
    pub async fn republish_pending(&self, recipient: &str) -> Result<bool> {
        self.engine.republish_pending(recipient).await
    }

    pub fn clear_pending(&self, recipient: &str) -> Option<String> {
        self.engine.clear_pending(recipient)
    }

    pub fn pending(&self, recipient: &str) -> Option<String> {
        self.engine.pending().get(recipient)
    }

    /// Recipients with undelivered messages
    pub fn pending_recipients(&self) -> Vec<String> {
        self.engine.pending().recipients()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.events.history()
    }

    /// Known peers with their current distance, nearest first
    pub fn peers(&self) -> Vec<PeerDistance> {
        self.registry
            .distances(&self.local.coordinate(), self.config.delivery.radius_m)
    }

    pub fn identity(&self) -> &str {
        self.local.identity()
    }

    pub fn coordinate(&self) -> Coordinate {
        self.local.coordinate()
    }

    /// Address the RPC server is bound to
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Endpoint advertised to peers
    pub fn advertised_address(&self) -> &PeerAddress {
        self.local.address()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Stop every background task and wait for them
    pub async fn shutdown(&self) {
        *self.state.write() = NodeState::Stopping;
        tracing::info!("Shutting down {}", self.local.identity());

        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        *self.state.write() = NodeState::Stopped;
        tracing::info!("Node stopped");
    }
}

impl Drop for GeoChatNode {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Topic routing for inbound publishes
struct Router {
    discovery_topic: String,
    backlog_topic: String,
    listener: Arc<PresenceListener>,
    inbound: Arc<InboundMessageHandler>,
    metrics: Arc<NodeMetrics>,
}

impl Router {
    async fn route(&self, message: TransportMessage) {
        if message.topic == self.discovery_topic {
            if let ListenerOutcome::Invalid(_) = self.listener.on_discovery_message(&message.payload).await {
                self.metrics.invalid_announcements.inc();
            }
        } else if message.topic == self.backlog_topic {
            if let Err(e) = self.inbound.on_backlog_message(&message.payload) {
                tracing::warn!("Dropping backlog message: {}", e);
            }
        } else {
            tracing::trace!("Ignoring publish on '{}'", message.topic);
        }
    }
}

fn spawn_dispatch(
    mut inbound_rx: InboundReceiver,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                message = inbound_rx.recv() => match message {
                    Some(message) => router.route(message).await,
                    None => {
                        tracing::warn!("Transport inbound channel closed");
                        break;
                    }
                },
            }
        }
        tracing::debug!("Dispatch task stopped");
    })
}

fn spawn_rpc_server(server: RpcServer, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.recv() => {}
            result = server.run() => {
                if let Err(e) = result {
                    tracing::error!("RPC server stopped: {}", e);
                }
            }
        }
    })
}

fn spawn_metrics_server(
    server: MetricsServer,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.recv() => {}
            result = server.run() => {
                if let Err(e) = result {
                    tracing::error!("Metrics server stopped: {}", e);
                }
            }
        }
    })
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use async_trait::async_trait;
    use geochat_core::wire::DirectMessage;
    use geochat_network::RpcError;

    struct NoRpc;

    #[async_trait]
    impl DirectDelivery for NoRpc {
        async fn deliver(
            &self,
            address: &PeerAddress,
            _message: &DirectMessage,
        ) -> std::result::Result<(), RpcError> {
            Err(RpcError::Unreachable(address.to_string()))
        }
    }

    fn config(identity: &str) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.identity = identity.to_string();
        config.node.latitude = 40.0;
        config.node.longitude = -8.0;
        config.broker.kind = BrokerKind::Memory;
        config.rpc.bind_address = "127.0.0.1".to_string();
        config.rpc.port = 0;
        config.rpc.advertise_ip = Some("127.0.0.1".to_string());
        config
    }

    #[tokio::test]
    async fn test_start_announces_and_stops() {
        let broker = MemoryBroker::new();
        let (transport, rx) = broker.connect("A").unwrap();

        let node = GeoChatNode::start(config("A"), Arc::new(transport), rx, Arc::new(NoRpc))
            .await
            .unwrap();
        assert_eq!(node.state(), NodeState::Running);
        assert_ne!(node.advertised_address().port, 0);

        let retained = broker.retained("users/online").unwrap();
        let ann = geochat_core::wire::DiscoveryAnnouncement::decode(&retained).unwrap();
        assert_eq!(ann.username, "A");
        assert_eq!(ann.port, node.rpc_addr().port());

        node.shutdown().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let broker = MemoryBroker::new();
        let (transport, rx) = broker.connect("x").unwrap();

        let result = GeoChatNode::start(NodeConfig::default(), Arc::new(transport), rx, Arc::new(NoRpc)).await;
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn test_unavailable_broker_is_fatal() {
        let broker = MemoryBroker::new();
        let (transport, rx) = broker.connect("A").unwrap();
        broker.set_available(false);

        let result = GeoChatNode::start(config("A"), Arc::new(transport), rx, Arc::new(NoRpc)).await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_update_location_reannounces() {
        let broker = MemoryBroker::new();
        let (transport, rx) = broker.connect("A").unwrap();
        let node = GeoChatNode::start(config("A"), Arc::new(transport), rx, Arc::new(NoRpc))
            .await
            .unwrap();

        node.update_location(41.5, -8.5).await.unwrap();
        let retained = broker.retained("users/online").unwrap();
        let ann = geochat_core::wire::DiscoveryAnnouncement::decode(&retained).unwrap();
        assert_eq!(ann.latitude, 41.5);
        assert_eq!(node.coordinate(), Coordinate::new(41.5, -8.5));

        assert!(node.update_location(100.0, 0.0).await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_memory_transport() {
        let settings = BrokerSettings {
            kind: BrokerKind::Memory,
            ..Default::default()
        };
        assert!(connect_transport(&settings, "A").await.is_ok());
    }
}
