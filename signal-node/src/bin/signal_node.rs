//! Signal Node binary entry point.
//!
//! This binary starts a signaling node with the HTTP/WebSocket front door and
//! joins the cluster overlay for the given topic.

use anyhow::{Context, Result};
use clap::Parser;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use signal_node::infrastructure::network::OverlayConfig;
use signal_node::{SignalNode, SignalNodeConfig};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Signal Node CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "signal-node")]
#[command(about = "Clustered WebRTC signaling server")]
struct Args {
    /// Topic shared by every node of the cluster.
    #[arg(default_value = "signal-mesh")]
    topic: String,

    /// HTTP and WebSocket port.
    #[arg(short, long, default_value_t = 4000)]
    port: u16,

    /// HTTP bind address.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Overlay listen addresses (multiaddr format).
    #[arg(short, long, default_value = "/ip4/0.0.0.0/tcp/0")]
    listen: Vec<String>,

    /// Bootstrap node addresses (multiaddr format, ending in /p2p/<peer-id>).
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Also run a DHT bootstrap responder.
    #[arg(long)]
    as_bootstrap: bool,

    /// Port of the bootstrap responder.
    #[arg(long, default_value_t = 4001)]
    bootstrap_port: u16,

    /// Hex-encoded ed25519 secret key (32 bytes). Generated when absent.
    #[arg(long)]
    secret_key: Option<String>,

    /// Enable mDNS for local discovery.
    #[arg(long)]
    mdns: bool,

    /// Add QUIC next to TCP.
    #[arg(long)]
    quic: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_bootstrap(addr_str: &str) -> Option<(PeerId, Multiaddr)> {
    let addr = match Multiaddr::from_str(addr_str) {
        Ok(addr) => addr,
        Err(_) => {
            tracing::warn!("Failed to parse bootstrap address: {}", addr_str);
            return None;
        }
    };
    // Extract peer ID from the multiaddr (last component should be /p2p/<peer_id>)
    let Some(Protocol::P2p(peer_id)) = addr.iter().last() else {
        tracing::warn!("Bootstrap address missing peer ID: {}", addr_str);
        return None;
    };
    // Address without the /p2p/ suffix for Kademlia
    let addr_without_p2p: Multiaddr = addr
        .iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect();
    Some((peer_id, addr_without_p2p))
}

fn parse_secret_key(hex_key: &str) -> Result<Keypair> {
    let mut bytes = hex::decode(hex_key).context("Secret key is not hex")?;
    Keypair::ed25519_from_bytes(&mut bytes).context("Secret key is not a 32-byte ed25519 key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Starting Signal Node");
    tracing::info!("Topic: {}", args.topic);

    let mut network_config = OverlayConfig {
        enable_mdns: args.mdns,
        enable_quic: args.quic,
        as_bootstrap: args.as_bootstrap,
        bootstrap_port: args.bootstrap_port,
        ..OverlayConfig::default()
    };

    network_config.listen_addrs = args
        .listen
        .iter()
        .filter_map(|s| match Multiaddr::from_str(s) {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("Ignoring listen address {}: {}", s, e);
                None
            }
        })
        .collect();

    for addr_str in &args.bootstrap {
        if let Some((peer_id, addr)) = parse_bootstrap(addr_str) {
            tracing::info!("Added bootstrap peer: {} at {}", peer_id, addr);
            network_config.bootstrap_nodes.push((peer_id, addr));
        }
    }

    if let Some(key) = &args.secret_key {
        network_config.keypair = Some(parse_secret_key(key)?);
    }

    let config = SignalNodeConfig {
        http_addr: SocketAddr::new(args.host, args.port),
        topic: args.topic,
        network_config,
        ..SignalNodeConfig::default()
    };

    let node = SignalNode::new(config)
        .await
        .context("Failed to create signal node")?;

    tracing::info!("Node ID: {}", node.node_id());

    tokio::select! {
        result = node.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, leaving the cluster");
            node.shutdown().await;
        }
    }

    Ok(())
}
