//! Presence Service - maintains the overlay topology view.
//!
//! Local connection changes are published to the cluster after a short
//! debounce, stamped with a logical timestamp. Updates from other nodes are
//! merged into the graph. Every structural change is announced (debounced)
//! to subscribers as a [`GraphSnapshot`].

use crate::domain::{ClusterMessage, Edge, GraphSnapshot, LogicalClock, NodeId, PresenceGraph};
use crate::infrastructure::debounce::Debouncer;
use crate::port::cluster_transport::ClusterTransport;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

pub const DEFAULT_PUBLISH_DELAY: Duration = Duration::from_secs(1);

/// Delay before subscribers hear about a burst of graph changes.
const NOTIFY_DELAY: Duration = Duration::from_millis(100);

struct PresenceInner<T: ClusterTransport> {
    transport: Arc<T>,
    graph: Mutex<PresenceGraph>,
    clock: Mutex<LogicalClock>,
    changes: broadcast::Sender<GraphSnapshot>,
}

pub struct PresenceService<T: ClusterTransport + 'static> {
    inner: Arc<PresenceInner<T>>,
    publisher: Debouncer,
    notifier: Debouncer,
}

impl<T: ClusterTransport + 'static> PresenceService<T> {
    pub fn new(transport: Arc<T>, publish_delay: Duration) -> Self {
        let owner = transport.local_node_id();
        let (changes, _) = broadcast::channel(16);
        let inner = Arc::new(PresenceInner {
            transport,
            graph: Mutex::new(PresenceGraph::new(owner)),
            clock: Mutex::new(LogicalClock::default()),
            changes,
        });

        let weak: Weak<PresenceInner<T>> = Arc::downgrade(&inner);
        let publisher = Debouncer::spawn(publish_delay, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.publish().await;
                }
            }
        });

        let weak: Weak<PresenceInner<T>> = Arc::downgrade(&inner);
        let notifier = Debouncer::spawn(NOTIFY_DELAY, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    let snapshot = inner.graph.lock().snapshot();
                    // No subscribers is fine.
                    let _ = inner.changes.send(snapshot);
                }
            }
        });

        Self {
            inner,
            publisher,
            notifier,
        }
    }

    pub fn on_node_connected(&self, node: &NodeId, initiator: bool) {
        let changed = {
            let mut graph = self.inner.graph.lock();
            let added = graph.add_node(node.clone());
            graph.add_connection(initiator, node.clone()) || added
        };
        if changed {
            self.notifier.trigger();
        }
        self.publisher.trigger();
    }

    pub fn on_node_disconnected(&self, node: &NodeId, initiator: bool) {
        let changed = {
            let mut graph = self.inner.graph.lock();
            let removed = graph.delete_connection(initiator, node);
            graph.delete_node(node) || removed
        };
        if changed {
            self.notifier.trigger();
        }
        self.publisher.trigger();
    }

    pub fn on_link_redirected(&self, node: &NodeId, initiator: bool) {
        if self.inner.graph.lock().redirect_connection(initiator, node.clone()) {
            self.notifier.trigger();
            self.publisher.trigger();
        }
    }

    /// Merge a `presence.update` from another node. Returns true if the graph changed.
    pub fn on_update(&self, from: &NodeId, timestamp: u64, edges: Vec<Edge>) -> bool {
        let changed = self.inner.graph.lock().update(from, timestamp, edges);
        if changed {
            tracing::debug!("Presence of {} updated at {}", from.short(), timestamp);
            self.notifier.trigger();
        }
        changed
    }

    /// Publish the local edges immediately.
    pub async fn publish_now(&self) {
        self.inner.publish().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphSnapshot> {
        self.inner.changes.subscribe()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner.graph.lock().snapshot()
    }

    /// Edges owned by `node` as currently known.
    pub fn edges_from(&self, node: &NodeId) -> Vec<Edge> {
        self.inner.graph.lock().edges_from(node)
    }
}

impl<T: ClusterTransport> PresenceInner<T> {
    async fn publish(&self) {
        let timestamp = self.clock.lock().tick(now_micros());
        let connections = self.graph.lock().connections();
        let count = connections.len();
        let message = ClusterMessage::PresenceUpdate {
            timestamp,
            connections,
        };
        match self.transport.broadcast(message).await {
            Ok(()) => tracing::debug!("Published presence: {} connections at {}", count, timestamp),
            Err(e) => tracing::warn!("Failed to publish presence: {}", e),
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
