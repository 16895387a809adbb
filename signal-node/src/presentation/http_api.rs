//! HTTP API for the signal node: read-only status views and the WebSocket front door.

use super::ws_session;
use crate::application_service::services::NodeServices;
use crate::domain::{NodeId, PeerId};
use crate::port::cluster_transport::ClusterTransport;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderValue},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Application state shared across handlers.
pub struct ApiState<T: ClusterTransport + 'static> {
    pub services: Arc<NodeServices<T>>,
    pub version: String,
}

impl<T: ClusterTransport + 'static> ApiState<T> {
    pub fn new(services: Arc<NodeServices<T>>, version: String) -> Self {
        Self { services, version }
    }
}

/// Create the API router.
pub fn create_router<T: ClusterTransport + 'static>(state: Arc<ApiState<T>>) -> Router {
    Router::new()
        .route("/", get(peers::<T>))
        .route("/status", get(status::<T>))
        .route("/health", get(health_check::<T>))
        .route("/signal", get(signal_socket::<T>))
        .with_state(state)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelView {
    pub channel: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub channels: Vec<ChannelView>,
    pub signals: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionView {
    pub id: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicView {
    pub id: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalView {
    pub topics: Vec<TopicView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: String,
    pub connections: Vec<ConnectionView>,
    pub signal: SignalView,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub updated_at: u64,
    pub revision: u64,
    pub version: String,
    pub nodes: Vec<NodeView>,
}

// ============================================================================
// Views
// ============================================================================

fn hex_peers(peers: &[PeerId]) -> Vec<String> {
    peers.iter().map(PeerId::to_hex).collect()
}

/// Every topic with all its peers, across owners.
pub fn channels_view<T: ClusterTransport + 'static>(services: &NodeServices<T>) -> Vec<ChannelView> {
    let directory = services.directory.lock();
    directory
        .topics()
        .into_iter()
        .map(|topic| ChannelView {
            channel: topic.to_hex(),
            peers: hex_peers(&directory.peers(&topic)),
        })
        .collect()
}

/// Short ids of every node in the presence graph.
pub fn signals_view<T: ClusterTransport + 'static>(services: &NodeServices<T>) -> Vec<String> {
    services
        .presence
        .snapshot()
        .nodes
        .iter()
        .map(|node| node.short().to_string())
        .collect()
}

/// One entry per known node with its owned connections and directory rows.
pub fn nodes_view<T: ClusterTransport + 'static>(services: &NodeServices<T>) -> Vec<NodeView> {
    let snapshot = services.presence.snapshot();
    let directory = services.directory.lock();

    let mut ids: Vec<NodeId> = snapshot.nodes.clone();
    for owner in directory.owners() {
        if !ids.contains(&owner) {
            ids.push(owner);
        }
    }

    ids.into_iter()
        .map(|node| {
            let connections = snapshot
                .edges
                .iter()
                .filter(|edge| edge.source == node)
                .map(|edge| ConnectionView {
                    id: format!("{}-{}", edge.source.short(), edge.target.short()),
                    target: edge.target.to_string(),
                })
                .collect();
            let topics = directory
                .owned_rows(&node)
                .into_iter()
                .map(|row| TopicView {
                    id: row.topic.to_hex(),
                    peers: hex_peers(&row.peers),
                })
                .collect();
            NodeView {
                id: node.to_string(),
                connections,
                signal: SignalView { topics },
            }
        })
        .collect()
}

// ============================================================================
// Handlers
// ============================================================================

fn observational<R: IntoResponse>(body: R) -> impl IntoResponse {
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
            (header::EXPIRES, HeaderValue::from_static("0")),
        ],
        body,
    )
}

/// Health check endpoint.
async fn health_check<T: ClusterTransport + 'static>(State(state): State<Arc<ApiState<T>>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.services.local_node_id().to_string(),
    })
}

/// Channels and peers known to this node.
async fn peers<T: ClusterTransport + 'static>(State(state): State<Arc<ApiState<T>>>) -> impl IntoResponse {
    observational(Json(PeersResponse {
        channels: channels_view(&state.services),
        signals: signals_view(&state.services),
        version: state.version.clone(),
    }))
}

/// Cluster topology and directory snapshot.
async fn status<T: ClusterTransport + 'static>(State(state): State<Arc<ApiState<T>>>) -> impl IntoResponse {
    let updated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let revision = state.services.directory.lock().revision();
    observational(Json(StatusResponse {
        updated_at,
        revision,
        version: state.version.clone(),
        nodes: nodes_view(&state.services),
    }))
}

/// WebSocket upgrade for signaling clients.
async fn signal_socket<T: ClusterTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let services = state.services.clone();
    ws.on_upgrade(move |socket| ws_session::handle_socket(socket, services))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_service::services::ServiceSettings;
    use crate::domain::{Edge, Topic};
    use crate::test_utils::MockClusterTransport;

    fn services() -> Arc<NodeServices<MockClusterTransport>> {
        Arc::new(NodeServices::new(
            Arc::new(MockClusterTransport::new("local-node")),
            ServiceSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_channels_view_merges_owners() {
        let services = services();
        let topic = Topic::from_name("room");
        {
            let mut directory = services.directory.lock();
            directory.add(topic, &NodeId::from("local-node"), PeerId::new(vec![0xaa]));
            directory.add(topic, &NodeId::from("remote-node"), PeerId::new(vec![0xbb]));
        }

        let channels = channels_view(&services);
        assert_eq!(
            channels,
            vec![ChannelView {
                channel: topic.to_hex(),
                peers: vec!["aa".to_string(), "bb".to_string()],
            }]
        );
    }

    #[tokio::test]
    async fn test_nodes_view_includes_edges_and_rows() {
        let services = services();
        let topic = Topic::from_name("room");
        services.presence.on_node_connected(&NodeId::from("remote-node"), true);
        services
            .presence
            .on_update(&NodeId::from("remote-node"), 5, vec![Edge::new(NodeId::from("remote-node"), NodeId::from("third"))]);
        services
            .directory
            .lock()
            .add(topic, &NodeId::from("remote-node"), PeerId::new(vec![1]));

        let nodes = nodes_view(&services);
        let remote = nodes.iter().find(|n| n.id == "remote-node").unwrap();
        assert_eq!(remote.connections.len(), 1);
        assert_eq!(remote.connections[0].target, "third");
        assert_eq!(remote.signal.topics[0].peers, vec!["01".to_string()]);

        let local = nodes.iter().find(|n| n.id == "local-node").unwrap();
        assert_eq!(local.connections[0].target, "remote-node");
        assert!(signals_view(&services).contains(&"ote-node".to_string()));
    }

    #[tokio::test]
    async fn test_router_builds() {
        let state = Arc::new(ApiState::new(services(), "test".to_string()));
        let _router = create_router(state);
    }
}
