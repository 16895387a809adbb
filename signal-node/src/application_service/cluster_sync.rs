//! Cluster Sync - keeps every node's directory in step with the local row.
//!
//! Local join/leave changes schedule a debounced push of the local rows to
//! every node. Pushes from other nodes replace their rows wholesale.

use crate::domain::peer_directory::SubscriptionId;
use crate::domain::{ClusterMessage, ClusterReply, DirectoryEvent, NodeId, OwnedRow, PeerDirectory, SignalError};
use crate::infrastructure::debounce::Debouncer;
use crate::port::client_rpc::ClientHandle;
use crate::port::cluster_transport::ClusterTransport;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Directory shared by the services of one node. The lock is never held across an await.
pub type SharedDirectory = Arc<Mutex<PeerDirectory<ClientHandle>>>;

/// Default coalescing window for local directory changes.
pub const DEFAULT_SYNC_DELAY: Duration = Duration::from_secs(2);

/// Outcome of one push round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Nodes that acknowledged the update.
    pub pushed: usize,
    /// Nodes that were no longer reachable.
    pub skipped: usize,
    /// Per-node failures (non-fatal).
    pub errors: Vec<String>,
}

struct SyncInner<T: ClusterTransport> {
    transport: Arc<T>,
    directory: SharedDirectory,
    local: NodeId,
    /// At most one push in flight.
    push_lock: AsyncMutex<()>,
}

pub struct ClusterSync<T: ClusterTransport + 'static> {
    inner: Arc<SyncInner<T>>,
    /// Held for the lifetime of the service; dropping it stops the push task.
    _debouncer: Debouncer,
    subscription: SubscriptionId,
}

impl<T: ClusterTransport + 'static> ClusterSync<T> {
    /// Create the service and start watching the local row.
    pub fn new(transport: Arc<T>, directory: SharedDirectory, delay: Duration) -> Self {
        let local = transport.local_node_id();
        let inner = Arc::new(SyncInner {
            transport,
            directory: directory.clone(),
            local,
            push_lock: AsyncMutex::new(()),
        });

        let weak: Weak<SyncInner<T>> = Arc::downgrade(&inner);
        let debouncer = Debouncer::spawn(delay, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.push_all().await;
                }
            }
        });

        let trigger = debouncer.handle();
        let subscription = directory.lock().subscribe(Box::new(move |event| {
            if matches!(
                event,
                DirectoryEvent::PeerAdded { .. } | DirectoryEvent::PeerDeleted { .. }
            ) {
                trigger.trigger();
            }
        }));

        Self {
            inner,
            _debouncer: debouncer,
            subscription,
        }
    }

    /// Push the local rows to every node right away.
    pub async fn push_now(&self) -> PushReport {
        self.inner.push_all().await
    }

    /// Apply a `discovery.update` from `from`. Returns true if its rows changed.
    pub fn on_update(&self, from: &NodeId, rows: Vec<OwnedRow>) -> bool {
        if *from == self.inner.local {
            return false;
        }
        let changed = self.inner.directory.lock().replace_owner_rows(from, rows);
        if changed {
            tracing::debug!("Replaced rows owned by {}", from.short());
        }
        changed
    }

    /// Send the current local rows to a node that just joined.
    pub fn on_node_connected(&self, node: &NodeId) {
        let inner = self.inner.clone();
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.push_to(&node).await {
                tracing::warn!("Initial sync to {} failed: {}", node.short(), e);
            }
        });
    }

    /// Drop everything the departed node owned.
    pub fn on_node_disconnected(&self, node: &NodeId) -> usize {
        let removed = self.inner.directory.lock().delete_all_by_owner(node);
        if removed > 0 {
            tracing::info!("Reaped {} peers owned by {}", removed, node.short());
        }
        removed
    }
}

impl<T: ClusterTransport + 'static> Drop for ClusterSync<T> {
    fn drop(&mut self) {
        self.inner.directory.lock().unsubscribe(self.subscription);
    }
}

impl<T: ClusterTransport> SyncInner<T> {
    fn update_message(&self) -> ClusterMessage {
        let rows = self.directory.lock().owned_rows(&self.local);
        ClusterMessage::DiscoveryUpdate { rows }
    }

    async fn push_all(&self) -> PushReport {
        let _guard = self.push_lock.lock().await;
        let message = self.update_message();
        let nodes = self.transport.nodes().await;

        let results = join_all(nodes.iter().map(|node| {
            let message = message.clone();
            async move { (node, self.transport.call(node, message).await) }
        }))
        .await;

        let mut report = PushReport::default();
        for (node, result) in results {
            match result.and_then(ClusterReply::into_result) {
                Ok(_) => report.pushed += 1,
                Err(SignalError::RpcUnreachable(_)) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!("Sync to {} failed: {}", node.short(), e);
                    report.errors.push(format!("{}: {}", node, e));
                }
            }
        }
        tracing::debug!(
            "Pushed local rows: {} ok, {} skipped, {} failed",
            report.pushed,
            report.skipped,
            report.errors.len()
        );
        report
    }

    async fn push_to(&self, node: &NodeId) -> Result<(), SignalError> {
        let _guard = self.push_lock.lock().await;
        let message = self.update_message();
        match self.transport.call(node, message).await.and_then(ClusterReply::into_result) {
            Ok(_) | Err(SignalError::RpcUnreachable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PeerId, Topic};
    use crate::test_utils::MockClusterTransport;

    fn setup(nodes: &[&str]) -> (Arc<MockClusterTransport>, SharedDirectory, ClusterSync<MockClusterTransport>) {
        let transport = Arc::new(
            MockClusterTransport::new("local").with_nodes(nodes.iter().map(|n| NodeId::from(*n)).collect()),
        );
        let directory = Arc::new(Mutex::new(PeerDirectory::new(NodeId::from("local"))));
        let sync = ClusterSync::new(transport.clone(), directory.clone(), DEFAULT_SYNC_DELAY);
        (transport, directory, sync)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_joins_is_one_push_per_node() {
        let (transport, directory, _sync) = setup(&["a", "b"]);
        let topic = Topic::from_name("room");
        for i in 0..5u8 {
            directory.lock().add(topic, &NodeId::from("local"), PeerId::new(vec![i]));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(transport.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0].1 {
            ClusterMessage::DiscoveryUpdate { rows } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].peers.len(), 5);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_changes_do_not_trigger_push() {
        let (transport, _directory, sync) = setup(&["a"]);
        let rows = vec![OwnedRow {
            topic: Topic::from_name("room"),
            peers: vec![PeerId::new(vec![9])],
        }];
        assert!(sync.on_update(&NodeId::from("a"), rows.clone()));
        assert!(!sync.on_update(&NodeId::from("a"), rows));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_from_self_is_ignored() {
        let (_transport, directory, sync) = setup(&[]);
        let rows = vec![OwnedRow {
            topic: Topic::from_name("room"),
            peers: vec![PeerId::new(vec![1])],
        }];
        assert!(!sync.on_update(&NodeId::from("local"), rows));
        assert!(directory.lock().topics().is_empty());
    }

    #[tokio::test]
    async fn test_push_counts_unreachable_as_skipped() {
        let (transport, _directory, sync) = setup(&["a", "gone", "broken"]);
        transport.fail_node(NodeId::from("gone"), SignalError::RpcUnreachable(NodeId::from("gone")));
        transport.fail_node(NodeId::from("broken"), SignalError::Transport("reset".to_string()));

        let report = sync.push_now().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_reaps_owner() {
        let (_transport, directory, sync) = setup(&[]);
        let topic = Topic::from_name("room");
        directory.lock().add(topic, &NodeId::from("b"), PeerId::new(vec![1]));
        directory.lock().add(topic, &NodeId::from("b"), PeerId::new(vec![2]));

        assert_eq!(sync.on_node_disconnected(&NodeId::from("b")), 2);
        assert!(directory.lock().peers(&topic).is_empty());
    }

    #[tokio::test]
    async fn test_new_node_receives_current_rows() {
        let (transport, directory, sync) = setup(&[]);
        let topic = Topic::from_name("room");
        directory.lock().add(topic, &NodeId::from("local"), PeerId::new(vec![7]));

        sync.on_node_connected(&NodeId::from("fresh"));
        for _ in 0..10 {
            if !transport.calls().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, NodeId::from("fresh"));
    }
}
