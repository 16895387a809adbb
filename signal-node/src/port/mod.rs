//! Port interfaces (traits) at the seams of the signal node.

pub mod client_rpc;
pub mod cluster_transport;

pub use client_rpc::{ClientHandle, ClientRpc};
pub use cluster_transport::{ClusterEvent, ClusterTransport, InboundCall};
