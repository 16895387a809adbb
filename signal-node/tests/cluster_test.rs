//! Multi-node behaviour over the in-memory cluster.
//!
//! These tests verify that nodes:
//! - Converge on the same directory after joins and leaves
//! - Route offers to the node owning the target peer
//! - Reap the rows of a node that left
//! - Ignore stale presence updates

use serde_json::json;
use signal_node::application_service::services::ServiceSettings;
use signal_node::domain::{ConnectionKey, Edge, NodeId, PeerId, SignalError, SignalRequest, Topic};
use signal_node::test_utils::{MemoryCluster, RecordingClient};
use std::sync::Arc;
use std::time::Duration;

fn peer(n: u8) -> PeerId {
    PeerId::new(vec![n])
}

/// Long enough for debounced pushes and presence publishes to drain.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

fn cluster(names: &[&str]) -> MemoryCluster {
    let mut cluster = MemoryCluster::new();
    for name in names {
        cluster.add_node(name, ServiceSettings::default());
    }
    cluster
}

#[tokio::test(start_paused = true)]
async fn test_directories_converge() {
    let cluster = cluster(&["a", "b", "c"]);
    cluster.connect_all();
    let topic = Topic::from_name("room");

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let node = cluster.node(name).unwrap();
        node.relay.join(
            topic,
            peer(i as u8),
            ConnectionKey::generate(),
            Arc::new(RecordingClient::new()),
        );
    }
    settle().await;

    let expected = vec![peer(0), peer(1), peer(2)];
    for name in ["a", "b", "c"] {
        assert_eq!(cluster.node(name).unwrap().relay.lookup(&topic), expected, "node {}", name);
    }

    cluster.node("b").unwrap().relay.leave(&topic, &peer(1));
    settle().await;

    for name in ["a", "b", "c"] {
        assert_eq!(
            cluster.node(name).unwrap().relay.lookup(&topic),
            vec![peer(0), peer(2)],
            "node {}",
            name
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_existing_rows() {
    let mut cluster = cluster(&["a"]);
    let topic = Topic::from_name("room");
    cluster.node("a").unwrap().relay.join(
        topic,
        peer(1),
        ConnectionKey::generate(),
        Arc::new(RecordingClient::new()),
    );
    settle().await;

    let late = cluster.add_node("late", ServiceSettings::default());
    cluster.connect("late", "a");
    settle().await;

    assert_eq!(late.relay.lookup(&topic), vec![peer(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_offer_is_routed_to_owner() {
    let cluster = cluster(&["a", "b"]);
    cluster.connect("a", "b");
    let topic = Topic::from_name("room");

    let x = Arc::new(RecordingClient::new().with_answer(json!({"sdp": "answer-from-x"})));
    let y = Arc::new(RecordingClient::new());
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();
    a.relay.join(topic, peer(1), ConnectionKey::generate(), x.clone());
    b.relay.join(topic, peer(2), ConnectionKey::generate(), y.clone());
    settle().await;

    let request = SignalRequest {
        topic,
        id: peer(2),
        remote_id: peer(1),
        data: json!({"sdp": "offer-from-y"}),
    };
    let answer = b.relay.offer(request.clone()).await.unwrap();
    assert_eq!(answer, json!({"sdp": "answer-from-x"}));
    assert_eq!(x.offers(), vec![request.clone()]);
    assert!(y.offers().is_empty());

    b.relay.candidates(request).await.unwrap();
    assert_eq!(x.candidates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offer_to_departed_peer_is_not_found() {
    let cluster = cluster(&["a", "b"]);
    cluster.connect("a", "b");
    let topic = Topic::from_name("room");
    let a = cluster.node("a").unwrap();
    let b = cluster.node("b").unwrap();

    let key = ConnectionKey::generate();
    a.relay.join(topic, peer(1), key, Arc::new(RecordingClient::new()));
    settle().await;

    // The client is gone on `a` but `b` has not heard yet.
    a.relay.on_disconnect(&key);
    let request = SignalRequest {
        topic,
        id: peer(2),
        remote_id: peer(1),
        data: json!({}),
    };
    let err = b.relay.offer(request).await.unwrap_err();
    assert_eq!(err, SignalError::PeerNotFound { topic, peer: peer(1) });
}

#[tokio::test(start_paused = true)]
async fn test_departed_node_rows_are_reaped() {
    let cluster = cluster(&["a", "b", "c"]);
    cluster.connect_all();
    let topic = Topic::from_name("room");
    cluster.node("b").unwrap().relay.join(
        topic,
        peer(7),
        ConnectionKey::generate(),
        Arc::new(RecordingClient::new()),
    );
    settle().await;
    assert_eq!(cluster.node("a").unwrap().relay.lookup(&topic), vec![peer(7)]);

    cluster.disconnect("a", "b");
    cluster.disconnect("b", "c");
    tokio::time::sleep(Duration::from_millis(10)).await;

    for name in ["a", "c"] {
        let node = cluster.node(name).unwrap();
        assert!(node.relay.lookup(&topic).is_empty(), "node {}", name);
        assert!(!node.directory.lock().owners().contains(&NodeId::from("b")));
    }
}

#[tokio::test(start_paused = true)]
async fn test_presence_spreads_and_ignores_stale_updates() {
    let cluster = cluster(&["a", "b"]);
    cluster.connect("a", "b");
    settle().await;

    let b = cluster.node("b").unwrap();
    let ab = Edge::new(NodeId::from("a"), NodeId::from("b"));
    assert_eq!(b.presence.edges_from(&NodeId::from("a")), vec![ab.clone()]);

    let last = b.presence.snapshot();
    assert!(!b.presence.on_update(&NodeId::from("a"), 1, vec![]));
    assert_eq!(b.presence.snapshot(), last);

    cluster.disconnect("a", "b");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!b.presence.snapshot().nodes.contains(&NodeId::from("a")));
}
