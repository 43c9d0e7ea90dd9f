//! # Neighbor Monitor
//!
//! Periodic task. Each tick recomputes the distance to every known peer,
//! reports the list to the presentation layer and, when at least one peer is
//! within the radius, pulls this node's backlog: subscribe to our own
//! backlog topic, hold the subscription for a grace window while the broker
//! replays the retained blob, then unsubscribe.
//!
//! A pull is polling, not retry; a failed pull is logged and the next tick
//! tries again.
//!
//! With a delivery engine attached, a tick also re-sends over direct RPC
//! whatever this node still holds for recipients that came back in zone.

use std::sync::Arc;
use std::time::Duration;

use geochat_core::types::PeerDistance;
use geochat_network::{LocalPeer, PeerRegistry, Transport, TransportError};
use tokio::sync::broadcast;

use crate::delivery::DeliveryEngine;
use crate::events::{EventBus, NodeEvent};
use crate::metrics::NodeMetrics;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub pull_grace: Duration,
    pub radius_m: f64,
    /// Our own backlog topic
    pub backlog_topic: String,
    pub pull_on_start: bool,
}

/// What one tick observed
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub peers: Vec<PeerDistance>,
    pub pulled: bool,
    /// Pending entries re-delivered directly
    pub flushed: usize,
}

pub struct NeighborMonitor {
    local: Arc<LocalPeer>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    metrics: Arc<NodeMetrics>,
    config: MonitorConfig,
    flush: Option<Arc<DeliveryEngine>>,
}

impl NeighborMonitor {
    pub fn new(
        local: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        metrics: Arc<NodeMetrics>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            local,
            registry,
            transport,
            events,
            metrics,
            config,
            flush: None,
        }
    }

    /// Flush pending messages through `engine` when their recipient is in zone
    pub fn with_pending_flush(mut self, engine: Arc<DeliveryEngine>) -> Self {
        self.flush = Some(engine);
        self
    }

    /// Run one evaluation, pulling at most once
    pub async fn tick(&self) -> TickReport {
        let peers = self
            .registry
            .distances(&self.local.coordinate(), self.config.radius_m);

        for peer in &peers {
            tracing::debug!(
                peer = %peer.identity,
                distance_m = peer.distance_m,
                in_zone = peer.in_zone,
                "{} is {:.1} m away ({})",
                peer.identity,
                peer.distance_m,
                if peer.in_zone { "in zone" } else { "out of zone" }
            );
        }

        let in_zone = peers.iter().filter(|p| p.in_zone).count();
        self.metrics.known_peers.set(peers.len() as i64);
        self.metrics.peers_in_zone.set(in_zone as i64);
        self.events.emit(NodeEvent::PeerListChanged(peers.clone()));

        let pulled = if in_zone > 0 {
            match self.pull().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Backlog pull failed: {}", e);
                    false
                }
            }
        } else {
            false
        };

        let mut flushed = 0;
        if let Some(engine) = &self.flush {
            for peer in peers.iter().filter(|p| p.in_zone) {
                if engine.pending().get(&peer.identity).is_some() {
                    flushed += engine.flush_pending(&peer.identity).await;
                }
            }
        }

        TickReport {
            peers,
            pulled,
            flushed,
        }
    }

    /// Open our backlog subscription for the grace window.
    ///
    /// Whatever the broker delivers meanwhile arrives on the node's dispatch
    /// task like any other publish.
    pub async fn pull(&self) -> Result<(), TransportError> {
        tracing::debug!("Pulling backlog from '{}'", self.config.backlog_topic);
        self.transport.subscribe(&self.config.backlog_topic).await?;
        tokio::time::sleep(self.config.pull_grace).await;
        self.metrics.backlog_pulls.inc();
        self.transport.unsubscribe(&self.config.backlog_topic).await
    }

    /// Tick on a fixed period until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            "Neighbor monitor started (interval: {:?}, radius: {} m)",
            self.config.interval,
            self.config.radius_m
        );

        if self.config.pull_on_start {
            if let Err(e) = self.pull().await {
                tracing::warn!("Startup backlog pull failed: {}", e);
            }
        }

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Neighbor monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geochat_core::types::{Coordinate, PeerAddress};
    use geochat_network::MemoryBroker;

    fn monitor(broker: &MemoryBroker) -> (NeighborMonitor, Arc<PeerRegistry>, Arc<EventBus>) {
        let (transport, _rx) = broker.connect("A").unwrap();
        let local = Arc::new(LocalPeer::new(
            "A",
            Coordinate::new(40.0, -8.0),
            PeerAddress::new("127.0.0.1", 8000),
        ));
        let registry = Arc::new(PeerRegistry::new("A"));
        let events = Arc::new(EventBus::new());
        let monitor = NeighborMonitor::new(
            local,
            registry.clone(),
            Arc::new(transport),
            events.clone(),
            Arc::new(NodeMetrics::new().unwrap()),
            MonitorConfig {
                interval: Duration::from_secs(30),
                pull_grace: Duration::from_secs(2),
                radius_m: 200.0,
                backlog_topic: "messages/A".to_string(),
                pull_on_start: false,
            },
        );
        (monitor, registry, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pull_without_neighbors_in_zone() {
        let broker = MemoryBroker::new();
        let (monitor, registry, events) = monitor(&broker);
        let mut rx = events.subscribe();
        registry.upsert("C", Coordinate::new(40.045, -8.0), PeerAddress::new("127.0.0.1", 8002));

        let report = monitor.tick().await;
        assert!(!report.pulled);
        assert_eq!(report.peers.len(), 1);
        assert!(!report.peers[0].in_zone);

        match rx.recv().await.unwrap() {
            NodeEvent::PeerListChanged(list) => assert_eq!(list[0].identity, "C"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_when_neighbor_in_zone() {
        let broker = MemoryBroker::new();
        let (monitor, registry, _) = monitor(&broker);
        registry.upsert("B", Coordinate::new(40.0, -8.001), PeerAddress::new("127.0.0.1", 8001));

        let report = monitor.tick().await;
        assert!(report.pulled);
        assert!(report.peers[0].in_zone);
        assert!(!broker.is_subscribed("A", "messages/A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_held_for_grace_window() {
        let broker = MemoryBroker::new();
        let (monitor, _, _) = monitor(&broker);
        let monitor = Arc::new(monitor);

        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.pull().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.is_subscribed("A", "messages/A"));

        task.await.unwrap().unwrap();
        assert!(!broker.is_subscribed("A", "messages/A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pull_is_not_fatal() {
        let broker = MemoryBroker::new();
        let (monitor, registry, _) = monitor(&broker);
        registry.upsert("B", Coordinate::new(40.0, -8.001), PeerAddress::new("127.0.0.1", 8001));
        broker.set_available(false);

        let report = monitor.tick().await;
        assert!(!report.pulled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        let (monitor, _, events) = monitor(&broker);
        let mut rx = events.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { monitor.run(shutdown_rx).await });

        // First periodic tick after one interval
        match rx.recv().await.unwrap() {
            NodeEvent::PeerListChanged(list) => assert!(list.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
