//! Test utilities and mock implementations for unit testing.
//!
//! This module provides mock implementations of the port traits and an
//! in-memory cluster hub, so services can be tested without sockets.

use crate::application_service::dispatcher::run_dispatcher;
use crate::application_service::services::{NodeServices, ServiceSettings};
use crate::domain::{ClusterMessage, ClusterReply, NodeId, SignalError, SignalRequest, SignalResult};
use crate::port::client_rpc::ClientRpc;
use crate::port::cluster_transport::{ClusterEvent, ClusterTransport, InboundCall};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// MockClusterTransport
// ============================================================================

/// Mock implementation of ClusterTransport for testing.
///
/// Records every call, emit and broadcast. Calls answer `Ack` unless a reply
/// or failure was scripted for the target node.
pub struct MockClusterTransport {
    local: NodeId,
    nodes: Mutex<Vec<NodeId>>,
    calls: Mutex<Vec<(NodeId, ClusterMessage)>>,
    emits: Mutex<Vec<(NodeId, ClusterMessage)>>,
    broadcasts: Mutex<Vec<ClusterMessage>>,
    replies: Mutex<HashMap<NodeId, ClusterReply>>,
    failures: Mutex<HashMap<NodeId, SignalError>>,
}

impl MockClusterTransport {
    pub fn new(local: &str) -> Self {
        Self {
            local: NodeId::from(local),
            nodes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            emits: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_nodes(self, nodes: Vec<NodeId>) -> Self {
        *self.nodes.lock() = nodes;
        self
    }

    pub fn reply_with(&self, node: NodeId, reply: ClusterReply) {
        self.replies.lock().insert(node, reply);
    }

    pub fn fail_node(&self, node: NodeId, error: SignalError) {
        self.failures.lock().insert(node, error);
    }

    pub fn calls(&self) -> Vec<(NodeId, ClusterMessage)> {
        self.calls.lock().clone()
    }

    pub fn emits(&self) -> Vec<(NodeId, ClusterMessage)> {
        self.emits.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<ClusterMessage> {
        self.broadcasts.lock().clone()
    }
}

#[async_trait]
impl ClusterTransport for MockClusterTransport {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    async fn nodes(&self) -> Vec<NodeId> {
        self.nodes.lock().clone()
    }

    async fn call(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<ClusterReply> {
        self.calls.lock().push((node.clone(), message));
        if let Some(error) = self.failures.lock().get(node) {
            return Err(error.clone());
        }
        Ok(self
            .replies
            .lock()
            .get(node)
            .cloned()
            .unwrap_or(ClusterReply::Ack))
    }

    async fn emit(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<()> {
        self.emits.lock().push((node.clone(), message));
        match self.failures.lock().get(node) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn broadcast(&self, message: ClusterMessage) -> SignalResult<()> {
        self.broadcasts.lock().push(message);
        Ok(())
    }
}

// ============================================================================
// RecordingClient
// ============================================================================

/// ClientRpc double that records what it receives.
pub struct RecordingClient {
    answer: Value,
    silent: bool,
    offers: Mutex<Vec<SignalRequest>>,
    candidates: Mutex<Vec<SignalRequest>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            answer: Value::Null,
            silent: false,
            offers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
        }
    }

    /// Answer every offer with `answer`.
    pub fn with_answer(mut self, answer: Value) -> Self {
        self.answer = answer;
        self
    }

    /// Never answer offers.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn offers(&self) -> Vec<SignalRequest> {
        self.offers.lock().clone()
    }

    pub fn candidates(&self) -> Vec<SignalRequest> {
        self.candidates.lock().clone()
    }
}

impl Default for RecordingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientRpc for RecordingClient {
    async fn offer(&self, request: &SignalRequest) -> SignalResult<Value> {
        self.offers.lock().push(request.clone());
        if self.silent {
            futures::future::pending::<()>().await;
        }
        Ok(self.answer.clone())
    }

    async fn candidates(&self, request: &SignalRequest) -> SignalResult<()> {
        self.candidates.lock().push(request.clone());
        Ok(())
    }
}

// ============================================================================
// MemoryCluster
// ============================================================================

#[derive(Default)]
struct Hub {
    inboxes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<ClusterEvent>>>,
    /// Undirected links, stored as ordered pairs.
    links: Mutex<BTreeSet<(NodeId, NodeId)>>,
}

impl Hub {
    fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn neighbours(&self, node: &NodeId) -> Vec<NodeId> {
        self.links
            .lock()
            .iter()
            .filter_map(|(a, b)| {
                if a == node {
                    Some(b.clone())
                } else if b == node {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn is_linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.links.lock().contains(&Hub::link(a, b))
    }

    fn deliver(&self, to: &NodeId, event: ClusterEvent) -> bool {
        self.inboxes
            .lock()
            .get(to)
            .is_some_and(|inbox| inbox.send(event).is_ok())
    }
}

/// ClusterTransport backed by an in-process hub.
pub struct MemoryTransport {
    local: NodeId,
    hub: Arc<Hub>,
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    async fn nodes(&self) -> Vec<NodeId> {
        self.hub.neighbours(&self.local)
    }

    async fn call(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<ClusterReply> {
        if !self.hub.is_linked(&self.local, node) {
            return Err(SignalError::RpcUnreachable(node.clone()));
        }
        let (tx, rx) = oneshot::channel();
        let call = ClusterEvent::Call(InboundCall {
            from: self.local.clone(),
            message,
            reply: Some(tx),
        });
        if !self.hub.deliver(node, call) {
            return Err(SignalError::RpcUnreachable(node.clone()));
        }
        rx.await
            .map_err(|_| SignalError::Transport("call dropped".to_string()))
    }

    async fn emit(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<()> {
        if !self.hub.is_linked(&self.local, node) {
            return Err(SignalError::RpcUnreachable(node.clone()));
        }
        let call = ClusterEvent::Call(InboundCall {
            from: self.local.clone(),
            message,
            reply: None,
        });
        self.hub.deliver(node, call);
        Ok(())
    }

    async fn broadcast(&self, message: ClusterMessage) -> SignalResult<()> {
        for node in self.hub.neighbours(&self.local) {
            self.hub.deliver(
                &node,
                ClusterEvent::Broadcast {
                    from: self.local.clone(),
                    message: message.clone(),
                },
            );
        }
        Ok(())
    }
}

/// Several nodes' services connected through memory, each with its own dispatcher.
#[derive(Default)]
pub struct MemoryCluster {
    hub: Arc<Hub>,
    nodes: HashMap<NodeId, Arc<NodeServices<MemoryTransport>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, settings: ServiceSettings) -> Arc<NodeServices<MemoryTransport>> {
        let local = NodeId::from(name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.inboxes.lock().insert(local.clone(), tx);

        let transport = Arc::new(MemoryTransport {
            local: local.clone(),
            hub: self.hub.clone(),
        });
        let services = Arc::new(NodeServices::new(transport, settings));
        tokio::spawn(run_dispatcher(services.clone(), rx));
        self.nodes.insert(local, services.clone());
        services
    }

    pub fn node(&self, name: &str) -> Option<Arc<NodeServices<MemoryTransport>>> {
        self.nodes.get(&NodeId::from(name)).cloned()
    }

    /// Open a link; `a` is the initiator.
    pub fn connect(&self, a: &str, b: &str) {
        let (a, b) = (NodeId::from(a), NodeId::from(b));
        if !self.hub.links.lock().insert(Hub::link(&a, &b)) {
            return;
        }
        self.hub.deliver(
            &a,
            ClusterEvent::NodeConnected {
                node: b.clone(),
                initiator: true,
            },
        );
        self.hub.deliver(
            &b,
            ClusterEvent::NodeConnected {
                node: a,
                initiator: false,
            },
        );
    }

    /// Close a link opened by `connect(a, b)`.
    pub fn disconnect(&self, a: &str, b: &str) {
        let (a, b) = (NodeId::from(a), NodeId::from(b));
        if !self.hub.links.lock().remove(&Hub::link(&a, &b)) {
            return;
        }
        self.hub.deliver(
            &a,
            ClusterEvent::NodeDisconnected {
                node: b.clone(),
                initiator: true,
            },
        );
        self.hub.deliver(
            &b,
            ClusterEvent::NodeDisconnected {
                node: a,
                initiator: false,
            },
        );
    }

    /// Connect every pair of nodes, in name order.
    pub fn connect_all(&self) {
        let mut names: Vec<&NodeId> = self.nodes.keys().collect();
        names.sort();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                self.connect(a.as_str(), b.as_str());
            }
        }
    }
}
