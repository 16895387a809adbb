//! WebSocket session of one signaling client.
//!
//! Frames are JSON objects. The client sends requests `{id, method, params}`
//! and gets `{id, result}` or `{id, error: {code, message}}` back. The node
//! calls the client the same way for `offer` and sends `candidates` as a
//! notification without `id`.

use crate::application_service::services::NodeServices;
use crate::domain::{ConnectionKey, PeerId, SignalError, SignalRequest, SignalResult, Topic};
use crate::port::client_rpc::{ClientHandle, ClientRpc};
use crate::port::cluster_transport::ClusterTransport;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<SignalError> for RpcError {
    fn from(e: SignalError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Request {
        #[serde(default)]
        id: Option<u64>,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<RpcError>,
    },
}

#[derive(Debug, Serialize)]
struct OutgoingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Serialize)]
struct OutgoingResponse {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerParams {
    topic: Topic,
    peer_id: PeerId,
}

#[derive(Debug, Deserialize)]
struct TopicParams {
    topic: Topic,
}

type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>;

/// The node's handle for calling back into one client.
pub struct WsClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingReplies,
    next_id: AtomicU64,
}

impl WsClient {
    pub fn new(outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Complete an outstanding call with the client's response.
    pub fn resolve(&self, id: u64, reply: Result<Value, RpcError>) -> bool {
        match self.pending.lock().remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding call.
    pub fn close(&self) {
        self.pending.lock().clear();
    }

    fn send(&self, method: &str, id: Option<u64>, params: Value) -> SignalResult<()> {
        let text = serde_json::to_string(&OutgoingRequest { id, method, params })?;
        self.outgoing
            .send(text)
            .map_err(|_| SignalError::Transport("client socket closed".to_string()))
    }
}

/// Removes a pending call when its caller gives up.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

#[async_trait]
impl ClientRpc for WsClient {
    async fn offer(&self, request: &SignalRequest) -> SignalResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.send("offer", Some(id), serde_json::to_value(request)?)?;
        match rx.await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(SignalError::Rpc(e.message)),
            Err(_) => Err(SignalError::Transport("client disconnected".to_string())),
        }
    }

    async fn candidates(&self, request: &SignalRequest) -> SignalResult<()> {
        self.send("candidates", None, serde_json::to_value(request)?)
    }
}

/// Run one client session until the socket closes.
pub async fn handle_socket<T: ClusterTransport + 'static>(socket: WebSocket, services: Arc<NodeServices<T>>) {
    let key = ConnectionKey::generate();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let client = Arc::new(WsClient::new(out_tx.clone()));
    tracing::debug!("Client session {} opened", key);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text(&services, key, &client, &out_tx, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Client session {} failed: {}", key, e);
                break;
            }
        }
    }

    services.relay.on_disconnect(&key);
    client.close();
    writer.abort();
    tracing::debug!("Client session {} closed", key);
}

async fn handle_text<T: ClusterTransport + 'static>(
    services: &Arc<NodeServices<T>>,
    key: ConnectionKey,
    client: &Arc<WsClient>,
    out: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::warn!("Malformed client frame: {}", e);
            return;
        }
    };

    match incoming {
        Incoming::Response { id, result, error } => {
            let reply = match error {
                Some(error) => Err(error),
                None => Ok(result),
            };
            if !client.resolve(id, reply) {
                tracing::debug!("Response {} matches no pending call", id);
            }
        }
        Incoming::Request { id, method, params } => {
            let services = services.clone();
            let handle: ClientHandle = client.clone();
            let out = out.clone();
            let respond = move |result: Result<Value, RpcError>| {
                let Some(id) = id else {
                    return;
                };
                let response = match result {
                    Ok(value) => OutgoingResponse {
                        id,
                        result: Some(value),
                        error: None,
                    },
                    Err(error) => OutgoingResponse {
                        id,
                        result: None,
                        error: Some(error),
                    },
                };
                match serde_json::to_string(&response) {
                    Ok(text) => {
                        let _ = out.send(text);
                    }
                    Err(e) => tracing::warn!("Failed to encode response: {}", e),
                }
            };

            if method == "offer" || method == "candidates" {
                // May wait on another client; keep reading frames meanwhile.
                tokio::spawn(async move {
                    respond(handle_request(&services, key, handle, &method, params).await);
                });
            } else {
                respond(handle_request(&services, key, handle, &method, params).await);
            }
        }
    }
}

/// Execute one client request.
pub async fn handle_request<T: ClusterTransport + 'static>(
    services: &NodeServices<T>,
    key: ConnectionKey,
    handle: ClientHandle,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    let invalid = |e: serde_json::Error| RpcError::new("INVALID_MESSAGE", e.to_string());
    match method {
        "join" => {
            let p: PeerParams = serde_json::from_value(params).map_err(invalid)?;
            let peers = services.relay.join(p.topic, p.peer_id, key, handle);
            Ok(serde_json::to_value(peers).map_err(invalid)?)
        }
        "leave" => {
            let p: PeerParams = serde_json::from_value(params).map_err(invalid)?;
            services.relay.leave(&p.topic, &p.peer_id);
            Ok(Value::Null)
        }
        "lookup" => {
            let p: TopicParams = serde_json::from_value(params).map_err(invalid)?;
            Ok(serde_json::to_value(services.relay.lookup(&p.topic)).map_err(invalid)?)
        }
        "offer" => {
            let request: SignalRequest = serde_json::from_value(params).map_err(invalid)?;
            Ok(services.relay.offer(request).await?)
        }
        "candidates" => {
            let request: SignalRequest = serde_json::from_value(params).map_err(invalid)?;
            services.relay.candidates(request).await?;
            Ok(Value::Null)
        }
        other => Err(RpcError::new("METHOD_NOT_FOUND", format!("unknown method {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_service::services::ServiceSettings;
    use crate::test_utils::{MockClusterTransport, RecordingClient};
    use serde_json::json;

    fn services() -> Arc<NodeServices<MockClusterTransport>> {
        Arc::new(NodeServices::new(
            Arc::new(MockClusterTransport::new("local")),
            ServiceSettings::default(),
        ))
    }

    #[test]
    fn test_incoming_frames_are_classified() {
        let request: Incoming = serde_json::from_str(r#"{"id":1,"method":"lookup","params":{}}"#).unwrap();
        assert!(matches!(request, Incoming::Request { id: Some(1), .. }));

        let response: Incoming = serde_json::from_str(r#"{"id":7,"result":{"sdp":"x"}}"#).unwrap();
        assert!(matches!(response, Incoming::Response { id: 7, error: None, .. }));

        let failure: Incoming =
            serde_json::from_str(r#"{"id":8,"error":{"code":"REJECTED","message":"busy"}}"#).unwrap();
        assert!(matches!(failure, Incoming::Response { error: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_join_then_lookup() {
        let services = services();
        let topic = Topic::from_name("room");
        let key = ConnectionKey::generate();
        let handle: ClientHandle = Arc::new(RecordingClient::new());

        let joined = handle_request(
            &services,
            key,
            handle.clone(),
            "join",
            json!({"topic": topic.to_hex(), "peerId": "0a0b"}),
        )
        .await
        .unwrap();
        assert_eq!(joined, json!(["0a0b"]));

        let peers = handle_request(&services, key, handle, "lookup", json!({"topic": topic.to_hex()}))
            .await
            .unwrap();
        assert_eq!(peers, json!(["0a0b"]));
    }

    #[tokio::test]
    async fn test_offer_to_unknown_peer_reports_code() {
        let services = services();
        let topic = Topic::from_name("room");
        let handle: ClientHandle = Arc::new(RecordingClient::new());
        let err = handle_request(
            &services,
            ConnectionKey::generate(),
            handle,
            "offer",
            json!({"topic": topic.to_hex(), "id": "01", "remoteId": "02", "data": {}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "PEER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let services = services();
        let handle: ClientHandle = Arc::new(RecordingClient::new());
        let key = ConnectionKey::generate();
        let err = handle_request(&services, key, handle.clone(), "dance", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, "METHOD_NOT_FOUND");

        let err = handle_request(&services, key, handle, "join", json!({"topic": "zz"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_ws_client_offer_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(WsClient::new(tx));
        let request = SignalRequest {
            topic: Topic::from_name("room"),
            id: PeerId::new(vec![1]),
            remote_id: PeerId::new(vec![2]),
            data: json!({"sdp": "offer"}),
        };

        let caller = {
            let client = client.clone();
            let request = request.clone();
            tokio::spawn(async move { client.offer(&request).await })
        };

        let sent: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["method"], "offer");
        assert_eq!(sent["params"]["remoteId"], "02");
        let id = sent["id"].as_u64().unwrap();

        assert!(client.resolve(id, Ok(json!({"sdp": "answer"}))));
        assert_eq!(caller.await.unwrap().unwrap(), json!({"sdp": "answer"}));
        assert!(!client.resolve(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_ws_client_candidates_is_notification() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = WsClient::new(tx);
        let request = SignalRequest {
            topic: Topic::from_name("room"),
            id: PeerId::new(vec![1]),
            remote_id: PeerId::new(vec![2]),
            data: json!([]),
        };
        client.candidates(&request).await.unwrap();
        let sent: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["method"], "candidates");
        assert!(sent.get("id").is_none());
    }

    #[tokio::test]
    async fn test_closed_session_fails_pending_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(WsClient::new(tx));
        let caller = {
            let client = client.clone();
            tokio::spawn(async move {
                let request = SignalRequest {
                    topic: Topic::from_name("room"),
                    id: PeerId::new(vec![1]),
                    remote_id: PeerId::new(vec![2]),
                    data: Value::Null,
                };
                client.offer(&request).await
            })
        };
        while client.pending.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        client.close();
        let result = caller.await.unwrap();
        assert!(matches!(result, Err(SignalError::Transport(_))));
    }
}
