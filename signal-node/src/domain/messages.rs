//! Payloads exchanged between signal nodes.

use super::error::SignalError;
use super::ids::{PeerId, Topic};
use super::peer_directory::OwnedRow;
use super::presence_graph::Edge;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Client signaling request relayed between nodes. `data` is the opaque
/// SDP offer or ICE candidate payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub topic: Topic,
    pub id: PeerId,
    pub remote_id: PeerId,
    #[serde(default)]
    pub data: Value,
}

/// Cluster-internal actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params")]
pub enum ClusterMessage {
    #[serde(rename = "discovery.update")]
    DiscoveryUpdate { rows: Vec<OwnedRow> },
    #[serde(rename = "discovery.offer")]
    Offer(SignalRequest),
    #[serde(rename = "discovery.candidates")]
    Candidates(SignalRequest),
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        timestamp: u64,
        connections: Vec<Edge>,
    },
}

impl ClusterMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ClusterMessage::DiscoveryUpdate { .. } => "discovery.update",
            ClusterMessage::Offer(_) => "discovery.offer",
            ClusterMessage::Candidates(_) => "discovery.candidates",
            ClusterMessage::PresenceUpdate { .. } => "presence.update",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SignalError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignalError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Answer to a cluster call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterReply {
    Ack,
    Answer { data: Value },
    PeerNotFound { topic: Topic, peer: PeerId },
    /// The owning node's client did not answer in time.
    Timeout { millis: u64 },
    Failed { message: String },
}

impl ClusterReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SignalError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignalError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Map an error onto the reply sent back to the calling node.
    pub fn from_error(error: &SignalError) -> Self {
        match error {
            SignalError::PeerNotFound { topic, peer } => ClusterReply::PeerNotFound {
                topic: *topic,
                peer: peer.clone(),
            },
            SignalError::Timeout(after) => ClusterReply::Timeout {
                millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            },
            other => ClusterReply::Failed {
                message: other.to_string(),
            },
        }
    }

    /// Convert a reply back into the caller-side result.
    pub fn into_result(self) -> Result<Value, SignalError> {
        match self {
            ClusterReply::Ack => Ok(Value::Null),
            ClusterReply::Answer { data } => Ok(data),
            ClusterReply::PeerNotFound { topic, peer } => {
                Err(SignalError::PeerNotFound { topic, peer })
            }
            ClusterReply::Timeout { millis } => Err(SignalError::Timeout(Duration::from_millis(millis))),
            ClusterReply::Failed { message } => Err(SignalError::Rpc(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::NodeId;
    use serde_json::json;

    #[test]
    fn test_action_names_on_the_wire() {
        let msg = ClusterMessage::PresenceUpdate {
            timestamp: 7,
            connections: vec![Edge::new(NodeId::from("a"), NodeId::from("b"))],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "presence.update");
        assert_eq!(value["params"]["timestamp"], 7);
        assert_eq!(value["params"]["connections"][0]["source"], "a");
        assert_eq!(msg.action(), "presence.update");
    }

    #[test]
    fn test_signal_request_uses_camel_case() {
        let req = SignalRequest {
            topic: Topic::from_name("t"),
            id: PeerId::new(vec![1]),
            remote_id: PeerId::new(vec![2]),
            data: json!({"sdp": "x"}),
        };
        let value = serde_json::to_value(ClusterMessage::Offer(req.clone())).unwrap();
        assert_eq!(value["action"], "discovery.offer");
        assert_eq!(value["params"]["remoteId"], "02");

        let bytes = ClusterMessage::Offer(req.clone()).to_bytes().unwrap();
        assert_eq!(
            ClusterMessage::from_bytes(&bytes).unwrap(),
            ClusterMessage::Offer(req)
        );
    }

    #[test]
    fn test_reply_maps_errors() {
        let topic = Topic::from_name("t");
        let peer = PeerId::new(vec![9]);
        let reply = ClusterReply::from_error(&SignalError::PeerNotFound {
            topic,
            peer: peer.clone(),
        });
        assert_eq!(
            reply.clone().into_result(),
            Err(SignalError::PeerNotFound { topic, peer })
        );

        let reply = ClusterReply::from_error(&SignalError::Transport("boom".into()));
        assert!(matches!(reply.into_result(), Err(SignalError::Rpc(_))));

        let reply = ClusterReply::from_error(&SignalError::Timeout(Duration::from_secs(10)));
        assert_eq!(reply, ClusterReply::Timeout { millis: 10_000 });
        assert_eq!(reply.into_result().unwrap_err().code(), "TIMEOUT");

        let answer = ClusterReply::Answer { data: json!(1) };
        assert_eq!(answer.into_result(), Ok(json!(1)));
    }

    #[test]
    fn test_invalid_bytes_are_invalid_message() {
        let err = ClusterMessage::from_bytes(b"{").unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");
    }
}
