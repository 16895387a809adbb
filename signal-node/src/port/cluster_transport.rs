//! ClusterTransport trait - node-to-node RPC and broadcast.

use crate::domain::{ClusterMessage, ClusterReply, NodeId, SignalResult};
use async_trait::async_trait;
use tokio::sync::oneshot;

/// A request from another node awaiting a reply.
#[derive(Debug)]
pub struct InboundCall {
    pub from: NodeId,
    pub message: ClusterMessage,
    /// `None` for fire-and-forget emits.
    pub reply: Option<oneshot::Sender<ClusterReply>>,
}

impl InboundCall {
    pub fn respond(self, reply: ClusterReply) {
        if let Some(tx) = self.reply {
            let _ = tx.send(reply);
        }
    }
}

/// Events a transport delivers to the node, in arrival order.
#[derive(Debug)]
pub enum ClusterEvent {
    /// A node finished the handshake. `initiator` is true when we dialed.
    NodeConnected { node: NodeId, initiator: bool },
    NodeDisconnected { node: NodeId, initiator: bool },
    /// A duplicate connection replaced the open link and its direction flipped.
    LinkRedirected { node: NodeId, initiator: bool },
    Broadcast { from: NodeId, message: ClusterMessage },
    Call(InboundCall),
}

/// Abstract interface for the cluster overlay.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Nodes with an open, handshaken connection.
    async fn nodes(&self) -> Vec<NodeId>;

    /// Point-to-point request. Fails with `RpcUnreachable` when `node` is not open.
    async fn call(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<ClusterReply>;

    /// Point-to-point send without waiting for the handler.
    async fn emit(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<()>;

    /// Flood to every node. Resolves immediately when there are no peers.
    async fn broadcast(&self, message: ClusterMessage) -> SignalResult<()>;
}
