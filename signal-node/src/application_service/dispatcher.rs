//! Routes cluster events to the services, in arrival order.

use super::services::NodeServices;
use crate::domain::{ClusterMessage, ClusterReply, NodeId};
use crate::port::cluster_transport::{ClusterEvent, ClusterTransport, InboundCall};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consume `events` until the transport closes the channel.
pub async fn run_dispatcher<T: ClusterTransport + 'static>(
    services: Arc<NodeServices<T>>,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
) {
    tracing::info!("Started cluster event dispatcher");
    while let Some(event) = events.recv().await {
        handle_event(&services, event);
    }
    tracing::info!("Cluster event channel closed, stopping dispatcher");
}

pub fn handle_event<T: ClusterTransport + 'static>(services: &Arc<NodeServices<T>>, event: ClusterEvent) {
    match event {
        ClusterEvent::NodeConnected { node, initiator } => {
            handle_node_connected(services, &node, initiator);
        }
        ClusterEvent::NodeDisconnected { node, initiator } => {
            handle_node_disconnected(services, &node, initiator);
        }
        ClusterEvent::LinkRedirected { node, initiator } => {
            tracing::debug!("Link to {} redirected (initiator: {})", node.short(), initiator);
            services.presence.on_link_redirected(&node, initiator);
        }
        ClusterEvent::Broadcast { from, message } => {
            handle_broadcast(services, &from, message);
        }
        ClusterEvent::Call(call) => {
            handle_call(services, call);
        }
    }
}

fn handle_node_connected<T: ClusterTransport + 'static>(services: &NodeServices<T>, node: &NodeId, initiator: bool) {
    tracing::info!("Cluster node joined: {} (initiator: {})", node.short(), initiator);
    services.presence.on_node_connected(node, initiator);
    services.sync.on_node_connected(node);
}

fn handle_node_disconnected<T: ClusterTransport + 'static>(services: &NodeServices<T>, node: &NodeId, initiator: bool) {
    tracing::info!("Cluster node left: {}", node.short());
    services.sync.on_node_disconnected(node);
    services.presence.on_node_disconnected(node, initiator);
}

fn handle_broadcast<T: ClusterTransport + 'static>(services: &NodeServices<T>, from: &NodeId, message: ClusterMessage) {
    match message {
        ClusterMessage::PresenceUpdate {
            timestamp,
            connections,
        } => {
            services.presence.on_update(from, timestamp, connections);
        }
        other => {
            tracing::debug!("Ignoring broadcast {} from {}", other.action(), from.short());
        }
    }
}

fn handle_call<T: ClusterTransport + 'static>(services: &Arc<NodeServices<T>>, call: InboundCall) {
    match &call.message {
        ClusterMessage::DiscoveryUpdate { rows } => {
            services.sync.on_update(&call.from, rows.clone());
            call.respond(ClusterReply::Ack);
        }
        ClusterMessage::PresenceUpdate {
            timestamp,
            connections,
        } => {
            services
                .presence
                .on_update(&call.from, *timestamp, connections.clone());
            call.respond(ClusterReply::Ack);
        }
        ClusterMessage::Offer(_) | ClusterMessage::Candidates(_) => {
            // Waiting on a client must not hold up later events.
            let services = services.clone();
            tokio::spawn(async move {
                let reply = match &call.message {
                    ClusterMessage::Offer(request) => services.relay.deliver_offer(request).await,
                    ClusterMessage::Candidates(request) => services.relay.deliver_candidates(request).await,
                    _ => ClusterReply::Ack,
                };
                call.respond(reply);
            });
        }
    }
}
