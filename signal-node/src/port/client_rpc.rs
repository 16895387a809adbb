//! ClientRpc trait - the channel back to one connected WebRTC client.

use crate::domain::{SignalRequest, SignalResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Delivery of signaling messages to a client connected to this node.
#[async_trait]
pub trait ClientRpc: Send + Sync {
    /// Forward an offer and wait for the client's answer.
    async fn offer(&self, request: &SignalRequest) -> SignalResult<Value>;

    /// Forward ICE candidates. Fire-and-forget on the client side.
    async fn candidates(&self, request: &SignalRequest) -> SignalResult<()>;
}

pub type ClientHandle = Arc<dyn ClientRpc>;
