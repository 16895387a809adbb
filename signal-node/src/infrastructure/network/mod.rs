//! Network infrastructure using libp2p.
//!
//! This module provides the node-to-node overlay:
//! - Kademlia DHT for rendezvous on the topic's discovery key
//! - RequestResponse carrying wire frames for RPC and broadcast
//! - Identify and Ping for address exchange and liveness
//! - mDNS for local peer discovery
//! - TCP and QUIC transports

pub mod behaviour;
pub mod connections;
pub mod overlay;
pub mod protocol;
pub mod transport;

pub use behaviour::{BehaviourConfig, NodeBehaviour, NodeBehaviourEvent};
pub use connections::{Admission, ConnectionTable, LinkState};
pub use overlay::{OverlayConfig, OverlayTransporter};
pub use protocol::FrameCodec;
