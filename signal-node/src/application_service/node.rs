//! Signal Node - Main node structure combining all components.

use super::dispatcher::run_dispatcher;
use super::services::{NodeServices, ServiceSettings};
use crate::domain::{NodeId, Topic, SIGNAL_PROTOCOL_VERSION};
use crate::infrastructure::network::{OverlayConfig, OverlayTransporter};
use crate::port::cluster_transport::ClusterTransport;
use crate::presentation::http_api::{create_router, ApiState};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Configuration for the signal node.
#[derive(Debug, Clone)]
pub struct SignalNodeConfig {
    /// HTTP and WebSocket listen address.
    pub http_addr: SocketAddr,
    /// User-facing topic name. The cluster joins a versioned hash of it.
    pub topic: String,
    /// Network configuration.
    pub network_config: OverlayConfig,
    /// Version string reported by the status endpoints.
    pub version: String,
    pub settings: ServiceSettings,
}

impl Default for SignalNodeConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 4000)),
            topic: "signal-mesh".to_string(),
            network_config: OverlayConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            settings: ServiceSettings::default(),
        }
    }
}

/// Slack between the client offer timeout and the node-to-node request timeout.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Overlay settings with the request timeout raised above the offer timeout.
fn overlay_config(config: &SignalNodeConfig) -> OverlayConfig {
    let mut network = config.network_config.clone();
    let floor = config.settings.offer_timeout + REQUEST_TIMEOUT_MARGIN;
    if network.request_timeout < floor {
        tracing::warn!(
            "Request timeout {:?} does not exceed offer timeout {:?}, using {:?}",
            network.request_timeout,
            config.settings.offer_timeout,
            floor
        );
        network.request_timeout = floor;
    }
    network
}

/// Type alias for the services of a libp2p-backed node.
pub type SignalServices = NodeServices<OverlayTransporter>;

/// Signal Node instance.
pub struct SignalNode {
    config: SignalNodeConfig,
    topic: Topic,
    network: Arc<OverlayTransporter>,
    services: Arc<SignalServices>,
    dispatcher: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalNode {
    /// Create a new SignalNode and join the overlay.
    pub async fn new(config: SignalNodeConfig) -> Result<Self> {
        let topic = Topic::from_name(&config.topic).versioned(SIGNAL_PROTOCOL_VERSION);
        tracing::info!(
            "Protocol version {}, topic {} -> {}",
            SIGNAL_PROTOCOL_VERSION,
            config.topic,
            topic
        );

        let (network, events) = OverlayTransporter::new(overlay_config(&config), topic)
            .await
            .context("Failed to create overlay")?;
        let network = Arc::new(network);

        let services = Arc::new(NodeServices::new(network.clone(), config.settings));

        // Started here so no cluster event is missed before `run`.
        let dispatcher = tokio::spawn(run_dispatcher(services.clone(), events));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            topic,
            network,
            services,
            dispatcher,
            shutdown_tx,
        })
    }

    /// Get the node ID.
    pub fn node_id(&self) -> NodeId {
        self.network.local_node_id()
    }

    /// The versioned topic the cluster rendezvous on.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Get a reference to the services.
    pub fn services(&self) -> &Arc<SignalServices> {
        &self.services
    }

    /// Get a reference to the network.
    pub fn network(&self) -> &Arc<OverlayTransporter> {
        &self.network
    }

    /// Connect to another node at the given multiaddr.
    pub async fn dial(&self, addr: &str) -> Result<()> {
        let multiaddr: libp2p::Multiaddr = addr.parse().context("Invalid multiaddr")?;
        self.network.dial(multiaddr).await
    }

    /// Get the addresses this node is listening on.
    pub async fn listen_addrs(&self) -> Vec<String> {
        self.network
            .listen_addrs()
            .await
            .into_iter()
            .map(|a| a.to_string())
            .collect()
    }

    /// Serve HTTP and WebSocket clients until [`SignalNode::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let state = Arc::new(ApiState::new(self.services.clone(), self.config.version.clone()));
        let router = create_router(state);

        tracing::info!(
            "Starting signal node {} on {}",
            self.node_id(),
            self.config.http_addr
        );

        let listener = tokio::net::TcpListener::bind(&self.config.http_addr)
            .await
            .context("Failed to bind HTTP listener")?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
            .context("HTTP server error")?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Leave the cluster: close every node connection and stop the
    /// bootstrap responder and the HTTP server. Returns the nodes that were connected.
    pub async fn shutdown(&self) -> Vec<NodeId> {
        let closed = self.network.shutdown().await;
        self.shutdown_tx.send_replace(true);
        tracing::info!("Signal node shut down, left {} nodes", closed.len());
        closed
    }
}

impl Drop for SignalNode {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SignalNodeConfig {
        SignalNodeConfig {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            topic: "test".to_string(),
            network_config: OverlayConfig {
                listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
                ..OverlayConfig::default()
            },
            ..SignalNodeConfig::default()
        }
    }

    #[test]
    fn test_signal_node_config_default() {
        let config = SignalNodeConfig::default();
        assert_eq!(config.http_addr.port(), 4000);
        assert!(!config.network_config.as_bootstrap);
        assert_eq!(config.settings.sync_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_request_timeout_exceeds_offer_timeout() {
        let mut config = SignalNodeConfig::default();
        assert!(overlay_config(&config).request_timeout > config.settings.offer_timeout);

        config.network_config.request_timeout = config.settings.offer_timeout;
        assert_eq!(
            overlay_config(&config).request_timeout,
            config.settings.offer_timeout + REQUEST_TIMEOUT_MARGIN
        );
    }

    #[tokio::test]
    async fn test_signal_node_uses_versioned_topic() {
        let node = SignalNode::new(test_config()).await.unwrap();
        let expected = Topic::from_name("test").versioned(SIGNAL_PROTOCOL_VERSION);
        assert_eq!(node.topic(), expected);
        assert_ne!(node.topic(), Topic::from_name("test"));
        assert_eq!(node.node_id(), NodeId::from(node.network().local_peer_id()));
    }

    #[tokio::test]
    async fn test_signal_node_listen_addrs() {
        let node = SignalNode::new(test_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!node.listen_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn test_signal_node_dial_invalid_addr() {
        let node = SignalNode::new(test_config()).await.unwrap();
        let result = node.dial("invalid-addr").await;
        assert!(result.unwrap_err().to_string().contains("Invalid multiaddr"));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let node = Arc::new(SignalNode::new(test_config()).await.unwrap());
        let server = {
            let node = node.clone();
            tokio::spawn(async move { node.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(node.shutdown().await.is_empty());
        let result = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
