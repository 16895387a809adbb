//! Signal Relay - client-facing join/leave/lookup and offer/candidate routing.

use super::cluster_sync::SharedDirectory;
use crate::domain::{
    ClusterMessage, ClusterReply, ConnectionKey, NodeId, PeerId, SignalError, SignalRequest, SignalResult, Topic,
};
use crate::port::client_rpc::ClientHandle;
use crate::port::cluster_transport::ClusterTransport;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default time a client has to answer an offer.
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SignalRelay<T: ClusterTransport> {
    transport: Arc<T>,
    directory: SharedDirectory,
    local: NodeId,
    offer_timeout: Duration,
}

impl<T: ClusterTransport> SignalRelay<T> {
    pub fn new(transport: Arc<T>, directory: SharedDirectory, offer_timeout: Duration) -> Self {
        let local = transport.local_node_id();
        Self {
            transport,
            directory,
            local,
            offer_timeout,
        }
    }

    /// Register `peer` on `topic` through this node and bind its connection.
    /// Returns the peers currently on the topic.
    pub fn join(&self, topic: Topic, peer: PeerId, connection: ConnectionKey, handle: ClientHandle) -> Vec<PeerId> {
        let mut directory = self.directory.lock();
        if directory.add(topic, &self.local, peer.clone()) {
            tracing::info!("Peer {} joined {}", peer, topic);
        }
        directory.register_connection(connection, peer, handle);
        directory.peers(&topic)
    }

    pub fn leave(&self, topic: &Topic, peer: &PeerId) -> bool {
        let removed = self.directory.lock().delete(topic, &self.local, peer);
        if removed {
            tracing::info!("Peer {} left {}", peer, topic);
        }
        removed
    }

    pub fn lookup(&self, topic: &Topic) -> Vec<PeerId> {
        self.directory.lock().peers(topic)
    }

    /// Route an offer to the node owning `remote_id` and return the answer.
    pub async fn offer(&self, request: SignalRequest) -> SignalResult<Value> {
        let owner = self.owner_of(&request)?;
        if owner == self.local {
            return self.offer_local(&request).await;
        }
        tracing::debug!("Forwarding offer for {} to {}", request.remote_id, owner.short());
        self.transport
            .call(&owner, ClusterMessage::Offer(request))
            .await?
            .into_result()
    }

    /// Route ICE candidates to the node owning `remote_id`.
    pub async fn candidates(&self, request: SignalRequest) -> SignalResult<()> {
        let owner = self.owner_of(&request)?;
        if owner == self.local {
            return self.candidates_local(&request).await;
        }
        self.transport
            .call(&owner, ClusterMessage::Candidates(request))
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Handle a forwarded `discovery.offer` from another node.
    pub async fn deliver_offer(&self, request: &SignalRequest) -> ClusterReply {
        match self.offer_local(request).await {
            Ok(data) => ClusterReply::Answer { data },
            Err(e) => ClusterReply::from_error(&e),
        }
    }

    /// Handle a forwarded `discovery.candidates` from another node.
    pub async fn deliver_candidates(&self, request: &SignalRequest) -> ClusterReply {
        match self.candidates_local(request).await {
            Ok(()) => ClusterReply::Ack,
            Err(e) => ClusterReply::from_error(&e),
        }
    }

    /// The client connection closed: drop its peers from every local row.
    pub fn on_disconnect(&self, connection: &ConnectionKey) -> Vec<PeerId> {
        let mut directory = self.directory.lock();
        let peers = directory.find_peers_by_connection(connection);
        for peer in &peers {
            let removed = directory.delete_peer_everywhere(&self.local, peer);
            tracing::info!("Peer {} disconnected, removed from {} topics", peer, removed);
        }
        directory.unregister_connection(connection);
        peers
    }

    fn owner_of(&self, request: &SignalRequest) -> SignalResult<NodeId> {
        let location = self
            .directory
            .lock()
            .find_owner(&request.topic, &request.remote_id)?;
        Ok(location.owner)
    }

    fn local_handle(&self, request: &SignalRequest) -> SignalResult<ClientHandle> {
        self.directory
            .lock()
            .find_connection_by_peer(&request.remote_id)
            .ok_or_else(|| SignalError::PeerNotFound {
                topic: request.topic,
                peer: request.remote_id.clone(),
            })
    }

    async fn offer_local(&self, request: &SignalRequest) -> SignalResult<Value> {
        let handle = self.local_handle(request)?;
        tokio::time::timeout(self.offer_timeout, handle.offer(request))
            .await
            .map_err(|_| SignalError::Timeout(self.offer_timeout))?
    }

    async fn candidates_local(&self, request: &SignalRequest) -> SignalResult<()> {
        let handle = self.local_handle(request)?;
        tokio::time::timeout(self.offer_timeout, handle.candidates(request))
            .await
            .map_err(|_| SignalError::Timeout(self.offer_timeout))?
    }
}
