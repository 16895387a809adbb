//! Error taxonomy of the signaling cluster.

use super::ids::{NodeId, PeerId, Topic};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// Directory miss. The target peer is not (or no longer) connected anywhere.
    #[error("peer {peer} not found on topic {topic}")]
    PeerNotFound { topic: Topic, peer: PeerId },

    /// Loser of a duplicate connection tie-break. Recovered by closing, never surfaced.
    #[error("duplicate connection to node {0}")]
    DuplicateConnection(NodeId),

    #[error("transport error: {0}")]
    Transport(String),

    /// No open connection to the target node.
    #[error("node {0} is not reachable")]
    RpcUnreachable(NodeId),

    /// The remote handler answered with a failure.
    #[error("remote call failed: {0}")]
    Rpc(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl SignalError {
    /// Stable code reported to WebSocket clients.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::PeerNotFound { .. } => "PEER_NOT_FOUND",
            SignalError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            SignalError::Transport(_) => "TRANSPORT",
            SignalError::RpcUnreachable(_) => "RPC_UNREACHABLE",
            SignalError::Rpc(_) => "RPC",
            SignalError::Timeout(_) => "TIMEOUT",
            SignalError::InvalidMessage(_) => "INVALID_MESSAGE",
        }
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        SignalError::InvalidMessage(e.to_string())
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
