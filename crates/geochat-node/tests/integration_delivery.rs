//! End-to-end delivery between nodes sharing one in-memory broker, with real
//! loopback JSON-RPC servers.

mod common;

use common::{knows, node_config, spawn_node, wait_until};
use geochat_core::types::MessageKind;
use geochat_core::wire::{AccumulatedMessageEnvelope, TIMESTAMP_FORMAT};
use geochat_network::MemoryBroker;
use geochat_node::{PendingReason, SendOutcome};

fn assert_single_entry(text: &str, message: &str) {
    assert!(!text.contains('\n'), "expected one entry, got {text:?}");
    let (timestamp, body) = text.split_once(" | ").unwrap();
    assert!(chrono::NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok());
    assert_eq!(body, message);
}

#[tokio::test]
async fn test_peers_discover_each_other() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;
    let b = spawn_node(&broker, node_config("B", 40.0, -8.001)).await;
    let c = spawn_node(&broker, node_config("C", 40.045, -8.0)).await;

    assert!(wait_until(|| knows(&a, "B") && knows(&a, "C")).await);
    assert!(wait_until(|| knows(&b, "A") && knows(&b, "C")).await);
    assert!(wait_until(|| knows(&c, "A") && knows(&c, "B")).await);

    // Nobody stores itself
    assert!(!knows(&a, "A"));

    let peers = a.peers();
    assert_eq!(peers[0].identity, "B");
    assert!((peers[0].distance_m - 111.139).abs() < 0.01);
    assert!(peers[0].in_zone);
    assert!(!peers[1].in_zone);

    for node in [a, b, c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_in_range_direct_delivery() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;
    let b = spawn_node(&broker, node_config("B", 40.0, -8.001)).await;
    assert!(wait_until(|| knows(&a, "B")).await);

    let outcome = a.send_message("B", "hi").await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    assert!(wait_until(|| !b.history().is_empty()).await);
    let received = &b.history()[0];
    assert_eq!(received.peer, "A");
    assert_eq!(received.text, "hi");
    assert_eq!(received.kind, MessageKind::Direct);

    assert!(a.pending("B").is_none());
    assert!(broker.retained("messages/B").is_none());
    assert_eq!(a.history()[0].kind, MessageKind::Sent);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_in_range_goes_to_backlog() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;
    let b = spawn_node(&broker, node_config("B", 40.0, -8.001)).await;
    assert!(wait_until(|| knows(&a, "B")).await);

    // B's RPC endpoint goes away; A still has B's last announcement
    b.shutdown().await;

    let outcome = a.send_message("B", "hi").await.unwrap();
    let SendOutcome::Queued { reason, backlog } = outcome else {
        panic!("expected the message to be queued");
    };
    assert!(matches!(reason, PendingReason::Unreachable { .. }));
    assert_single_entry(&backlog, "hi");
    assert_eq!(a.pending("B").unwrap(), backlog);

    let retained = broker.retained("messages/B").unwrap();
    let envelope = AccumulatedMessageEnvelope::decode(&retained).unwrap();
    assert_eq!(envelope.sender, "A");
    assert_eq!(envelope.accumulated_text, backlog);

    a.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_skips_rpc() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;
    let c = spawn_node(&broker, node_config("C", 40.045, -8.0)).await;
    assert!(wait_until(|| knows(&a, "C")).await);

    let outcome = a.send_message("C", "far").await.unwrap();
    match outcome {
        SendOutcome::Queued {
            reason: PendingReason::OutOfRange { distance_m },
            backlog,
        } => {
            assert!((distance_m - 5001.255).abs() < 0.01);
            assert_single_entry(&backlog, "far");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // C's RPC server never saw a call
    assert!(c.history().is_empty());
    assert!(broker.retained("messages/C").is_some());

    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_unknown_recipient() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;

    let err = a.send_message("nobody", "hi").await.unwrap_err();
    assert!(matches!(err, geochat_node::NodeError::UnknownRecipient(_)));
    assert!(a.pending_recipients().is_empty());
    assert!(broker.retained("messages/nobody").is_none());

    a.shutdown().await;
}

#[tokio::test]
async fn test_backlog_pulled_when_neighbor_in_zone() {
    let broker = MemoryBroker::new();
    let a = spawn_node(&broker, node_config("A", 40.0, -8.0)).await;
    let c = spawn_node(&broker, node_config("C", 40.045, -8.0)).await;
    assert!(wait_until(|| knows(&a, "C") && knows(&c, "A")).await);

    a.send_message("C", "hello").await.unwrap();
    a.send_message("C", "world").await.unwrap();
    let lines: Vec<String> = a.pending("C").unwrap().lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 2);

    // Nobody in zone: no pull, nothing surfaces
    let report = c.refresh_neighbors().await;
    assert!(!report.pulled);
    assert!(c.history().is_empty());

    // C walks next to A and pulls its backlog
    c.update_location(40.0, -8.0005).await.unwrap();
    let report = c.refresh_neighbors().await;
    assert!(report.pulled);

    assert!(wait_until(|| c.history().len() == 2).await);
    let history = c.history();
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[1].text, "world");
    assert!(history.iter().all(|e| e.kind == MessageKind::WasPending && e.peer == "A"));

    // Second pull replays the same blob; nothing new surfaces
    c.refresh_neighbors().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(c.history().len(), 2);

    // Pulling never touches the sender's buffer
    assert_eq!(a.pending("C").unwrap().lines().count(), 2);

    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_pending_flushed_when_recipient_returns() {
    let broker = MemoryBroker::new();
    let mut config = node_config("A", 40.0, -8.0);
    config.delivery.flush_on_reentry = true;
    let a = spawn_node(&broker, config).await;
    let c = spawn_node(&broker, node_config("C", 40.045, -8.0)).await;
    assert!(wait_until(|| knows(&a, "C")).await);

    a.send_message("C", "hello").await.unwrap();
    a.send_message("C", "world").await.unwrap();

    // Nothing to flush while C is far away
    assert_eq!(a.refresh_neighbors().await.flushed, 0);

    c.update_location(40.0, -8.0005).await.unwrap();
    assert!(wait_until(|| a.peers().first().is_some_and(|p| p.identity == "C" && p.in_zone)).await);

    let report = a.refresh_neighbors().await;
    assert_eq!(report.flushed, 2);
    assert!(a.pending("C").is_none());

    assert!(wait_until(|| c.history().len() == 2).await);
    let history = c.history();
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[1].text, "world");
    assert!(history.iter().all(|e| e.kind == MessageKind::WasPending && e.peer == "A"));

    // The retained blob still holds both; pulling it surfaces nothing new
    assert!(c.refresh_neighbors().await.pulled);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(c.history().len(), 2);

    a.shutdown().await;
    c.shutdown().await;
}
