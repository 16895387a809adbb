//! Per-node directory of client peers, partitioned by topic and owning node.
//!
//! The row owned by the local node is mutated only by client join/leave.
//! Rows owned by other nodes are replaced wholesale by cluster sync.
//! Observers are called synchronously, in registration order, exactly once
//! per effective mutation.

use super::error::{SignalError, SignalResult};
use super::ids::{ConnectionKey, NodeId, PeerId, Topic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Change notification emitted by [`PeerDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A peer was added to the local node's row.
    PeerAdded {
        topic: Topic,
        owner: NodeId,
        peer: PeerId,
    },
    /// A peer was removed from the local node's row.
    PeerDeleted {
        topic: Topic,
        owner: NodeId,
        peer: PeerId,
    },
    /// Rows owned by a remote node changed.
    RemoteRowsChanged { owner: NodeId },
}

/// The peers one node owns on one topic. Unit of the `discovery.update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub topic: Topic,
    pub peers: Vec<PeerId>,
}

/// Result of [`PeerDirectory::find_owner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLocation {
    pub topic: Topic,
    pub owner: NodeId,
    pub peer: PeerId,
}

/// Active client connection able to receive offers and candidates. One
/// connection may carry several peer ids.
#[derive(Debug, Clone)]
pub struct ConnectionRecord<H> {
    pub node: NodeId,
    pub peers: BTreeSet<PeerId>,
    pub handle: H,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type DirectoryObserver = Box<dyn Fn(&DirectoryEvent) + Send + Sync>;

pub struct PeerDirectory<H> {
    local: NodeId,
    rows: BTreeMap<Topic, BTreeMap<NodeId, BTreeSet<PeerId>>>,
    connections: HashMap<ConnectionKey, ConnectionRecord<H>>,
    connection_by_peer: HashMap<PeerId, ConnectionKey>,
    observers: Vec<(SubscriptionId, DirectoryObserver)>,
    next_subscription: u64,
    revision: u64,
}

impl<H: Clone> PeerDirectory<H> {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            rows: BTreeMap::new(),
            connections: HashMap::new(),
            connection_by_peer: HashMap::new(),
            observers: Vec::new(),
            next_subscription: 0,
            revision: 0,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Monotonic counter bumped on every effective row mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe(&mut self, observer: DirectoryObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    /// Insert `peer` into the row `(topic, owner)`. Returns false if already present.
    pub fn add(&mut self, topic: Topic, owner: &NodeId, peer: PeerId) -> bool {
        if !self.insert_row(topic, owner, peer.clone()) {
            return false;
        }
        self.revision += 1;
        if *owner == self.local {
            self.emit(DirectoryEvent::PeerAdded {
                topic,
                owner: owner.clone(),
                peer,
            });
        } else {
            self.emit(DirectoryEvent::RemoteRowsChanged {
                owner: owner.clone(),
            });
        }
        true
    }

    /// Remove `peer` from `(topic, owner)`. Returns false and stays silent on a miss.
    pub fn delete(&mut self, topic: &Topic, owner: &NodeId, peer: &PeerId) -> bool {
        if !self.remove_row(topic, owner, peer) {
            return false;
        }
        self.revision += 1;
        if *owner == self.local {
            self.emit(DirectoryEvent::PeerDeleted {
                topic: *topic,
                owner: owner.clone(),
                peer: peer.clone(),
            });
        } else {
            self.emit(DirectoryEvent::RemoteRowsChanged {
                owner: owner.clone(),
            });
        }
        true
    }

    /// Drop every row contributed by `owner`. Returns the number of peers removed.
    pub fn delete_all_by_owner(&mut self, owner: &NodeId) -> usize {
        let removed = self.take_owner_rows(owner);
        if removed.is_empty() {
            return 0;
        }
        self.revision += 1;
        if *owner == self.local {
            for (topic, peer) in &removed {
                self.emit(DirectoryEvent::PeerDeleted {
                    topic: *topic,
                    owner: owner.clone(),
                    peer: peer.clone(),
                });
            }
        } else {
            self.emit(DirectoryEvent::RemoteRowsChanged {
                owner: owner.clone(),
            });
        }
        removed.len()
    }

    /// Clear every row of `owner`, then install `rows`. Peers missing from
    /// `rows` are pruned. Returns true if the owner's contribution changed.
    pub fn replace_owner_rows(&mut self, owner: &NodeId, rows: Vec<OwnedRow>) -> bool {
        let old = self.take_owner_rows(owner);
        let mut new = BTreeSet::new();
        for row in rows {
            for peer in row.peers {
                if self.insert_row(row.topic, owner, peer.clone()) {
                    new.insert((row.topic, peer));
                }
            }
        }

        if old == new {
            return false;
        }
        self.revision += 1;

        if *owner == self.local {
            for (topic, peer) in old.difference(&new) {
                self.emit(DirectoryEvent::PeerDeleted {
                    topic: *topic,
                    owner: owner.clone(),
                    peer: peer.clone(),
                });
            }
            for (topic, peer) in new.difference(&old) {
                self.emit(DirectoryEvent::PeerAdded {
                    topic: *topic,
                    owner: owner.clone(),
                    peer: peer.clone(),
                });
            }
        } else {
            self.emit(DirectoryEvent::RemoteRowsChanged {
                owner: owner.clone(),
            });
        }
        true
    }

    /// Remove `peer` from every topic row owned by `owner`.
    pub fn delete_peer_everywhere(&mut self, owner: &NodeId, peer: &PeerId) -> usize {
        let topics: Vec<Topic> = self
            .rows
            .iter()
            .filter(|(_, owners)| owners.get(owner).is_some_and(|peers| peers.contains(peer)))
            .map(|(topic, _)| *topic)
            .collect();
        topics
            .iter()
            .filter(|topic| self.delete(topic, owner, peer))
            .count()
    }

    /// All peers on `topic`, across owners.
    pub fn peers(&self, topic: &Topic) -> Vec<PeerId> {
        let Some(owners) = self.rows.get(topic) else {
            return Vec::new();
        };
        owners
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.rows.keys().copied().collect()
    }

    /// Nodes that currently own at least one row.
    pub fn owners(&self) -> BTreeSet<NodeId> {
        self.rows
            .values()
            .flat_map(|owners| owners.keys().cloned())
            .collect()
    }

    /// Rows owned by `owner`, one entry per topic.
    pub fn owned_rows(&self, owner: &NodeId) -> Vec<OwnedRow> {
        self.rows
            .iter()
            .filter_map(|(topic, owners)| {
                owners.get(owner).map(|peers| OwnedRow {
                    topic: *topic,
                    peers: peers.iter().cloned().collect(),
                })
            })
            .collect()
    }

    /// Resolve the node a peer is connected through. The local row wins when
    /// a peer is transiently listed under several owners.
    pub fn find_owner(&self, topic: &Topic, peer: &PeerId) -> SignalResult<PeerLocation> {
        let not_found = || SignalError::PeerNotFound {
            topic: *topic,
            peer: peer.clone(),
        };
        let owners = self.rows.get(topic).ok_or_else(not_found)?;

        let owner = if owners.get(&self.local).is_some_and(|p| p.contains(peer)) {
            Some(&self.local)
        } else {
            owners
                .iter()
                .find(|(_, peers)| peers.contains(peer))
                .map(|(owner, _)| owner)
        };

        owner
            .map(|owner| PeerLocation {
                topic: *topic,
                owner: owner.clone(),
                peer: peer.clone(),
            })
            .ok_or_else(not_found)
    }

    /// Bind `peer` to `key`. A peer reconnecting on a new key leaves its old one.
    pub fn register_connection(&mut self, key: ConnectionKey, peer: PeerId, handle: H) {
        if let Some(previous) = self.connection_by_peer.insert(peer.clone(), key) {
            if previous != key {
                let emptied = self.connections.get_mut(&previous).is_some_and(|record| {
                    record.peers.remove(&peer);
                    record.peers.is_empty()
                });
                if emptied {
                    self.connections.remove(&previous);
                }
            }
        }
        let node = self.local.clone();
        let record = self.connections.entry(key).or_insert_with(|| ConnectionRecord {
            node,
            peers: BTreeSet::new(),
            handle: handle.clone(),
        });
        record.peers.insert(peer);
        record.handle = handle;
    }

    pub fn unregister_connection(&mut self, key: &ConnectionKey) -> Option<ConnectionRecord<H>> {
        let record = self.connections.remove(key)?;
        for peer in &record.peers {
            if self.connection_by_peer.get(peer) == Some(key) {
                self.connection_by_peer.remove(peer);
            }
        }
        Some(record)
    }

    pub fn find_connection_by_peer(&self, peer: &PeerId) -> Option<H> {
        self.connection_by_peer
            .get(peer)
            .and_then(|key| self.connections.get(key))
            .map(|record| record.handle.clone())
    }

    pub fn find_peers_by_connection(&self, key: &ConnectionKey) -> Vec<PeerId> {
        self.connections
            .get(key)
            .map(|record| record.peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn insert_row(&mut self, topic: Topic, owner: &NodeId, peer: PeerId) -> bool {
        self.rows
            .entry(topic)
            .or_default()
            .entry(owner.clone())
            .or_default()
            .insert(peer)
    }

    fn remove_row(&mut self, topic: &Topic, owner: &NodeId, peer: &PeerId) -> bool {
        let Some(owners) = self.rows.get_mut(topic) else {
            return false;
        };
        let Some(peers) = owners.get_mut(owner) else {
            return false;
        };
        if !peers.remove(peer) {
            return false;
        }
        if peers.is_empty() {
            owners.remove(owner);
        }
        if owners.is_empty() {
            self.rows.remove(topic);
        }
        true
    }

    fn take_owner_rows(&mut self, owner: &NodeId) -> BTreeSet<(Topic, PeerId)> {
        let mut removed = BTreeSet::new();
        self.rows.retain(|topic, owners| {
            if let Some(peers) = owners.remove(owner) {
                removed.extend(peers.into_iter().map(|peer| (*topic, peer)));
            }
            !owners.is_empty()
        });
        removed
    }

    fn emit(&self, event: DirectoryEvent) {
        for (_, observer) in &self.observers {
            observer(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn topic(name: &str) -> Topic {
        Topic::from_name(name)
    }

    fn peer(b: u8) -> PeerId {
        PeerId::new(vec![b])
    }

    fn recording(dir: &mut PeerDirectory<()>) -> Arc<Mutex<Vec<DirectoryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dir.subscribe(Box::new(move |e| sink.lock().unwrap().push(e.clone())));
        events
    }

    #[test]
    fn test_add_and_delete_local_row_emit_events() {
        let local = NodeId::from("a");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        let events = recording(&mut dir);

        assert!(dir.add(topic("t"), &local, peer(1)));
        assert!(!dir.add(topic("t"), &local, peer(1)));
        assert!(dir.delete(&topic("t"), &local, &peer(1)));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DirectoryEvent::PeerAdded { .. }));
        assert!(matches!(events[1], DirectoryEvent::PeerDeleted { .. }));
        assert!(dir.topics().is_empty());
    }

    #[test]
    fn test_delete_missing_peer_is_silent() {
        let local = NodeId::from("a");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        dir.add(topic("t"), &local, peer(1));
        let events = recording(&mut dir);
        let revision = dir.revision();

        assert!(!dir.delete(&topic("t"), &local, &peer(2)));
        assert!(!dir.delete(&topic("other"), &local, &peer(1)));
        assert!(!dir.delete(&topic("t"), &NodeId::from("b"), &peer(1)));

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(dir.revision(), revision);
    }

    #[test]
    fn test_replace_owner_rows_prunes_missing_peers() {
        let mut dir = PeerDirectory::<()>::new(NodeId::from("a"));
        let remote = NodeId::from("b");

        dir.replace_owner_rows(
            &remote,
            vec![OwnedRow {
                topic: topic("t"),
                peers: vec![peer(1), peer(2)],
            }],
        );
        dir.replace_owner_rows(
            &remote,
            vec![OwnedRow {
                topic: topic("t"),
                peers: vec![peer(2)],
            }],
        );
        assert_eq!(dir.peers(&topic("t")), vec![peer(2)]);

        dir.replace_owner_rows(&remote, vec![]);
        assert!(dir.owned_rows(&remote).is_empty());
        assert!(dir.topics().is_empty());
    }

    #[test]
    fn test_remote_replace_emits_single_remote_event() {
        let mut dir = PeerDirectory::<()>::new(NodeId::from("a"));
        let events = recording(&mut dir);
        let remote = NodeId::from("b");
        let rows = vec![OwnedRow {
            topic: topic("t"),
            peers: vec![peer(1), peer(2)],
        }];

        assert!(dir.replace_owner_rows(&remote, rows.clone()));
        assert!(!dir.replace_owner_rows(&remote, rows));

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![DirectoryEvent::RemoteRowsChanged {
                owner: remote.clone()
            }]
        );
    }

    #[test]
    fn test_delete_all_by_owner_keeps_other_owners() {
        let local = NodeId::from("a");
        let remote = NodeId::from("b");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        dir.add(topic("t"), &local, peer(1));
        dir.add(topic("t"), &remote, peer(2));
        dir.add(topic("u"), &remote, peer(3));

        assert_eq!(dir.delete_all_by_owner(&remote), 2);
        assert_eq!(dir.peers(&topic("t")), vec![peer(1)]);
        assert_eq!(dir.topics(), vec![topic("t")]);
        assert_eq!(dir.delete_all_by_owner(&remote), 0);
    }

    #[test]
    fn test_find_owner_prefers_local_row() {
        let local = NodeId::from("a");
        let remote = NodeId::from("0");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        dir.add(topic("t"), &remote, peer(1));
        assert_eq!(dir.find_owner(&topic("t"), &peer(1)).unwrap().owner, remote);

        dir.add(topic("t"), &local, peer(1));
        assert_eq!(dir.find_owner(&topic("t"), &peer(1)).unwrap().owner, local);

        let err = dir.find_owner(&topic("t"), &peer(9)).unwrap_err();
        assert_eq!(err.code(), "PEER_NOT_FOUND");
        assert!(dir.find_owner(&topic("missing"), &peer(1)).is_err());
    }

    #[test]
    fn test_owned_rows_groups_by_topic() {
        let local = NodeId::from("a");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        dir.add(topic("t"), &local, peer(1));
        dir.add(topic("t"), &local, peer(2));
        dir.add(topic("u"), &local, peer(1));
        dir.add(topic("u"), &NodeId::from("b"), peer(5));

        let rows = dir.owned_rows(&local);
        assert_eq!(rows.len(), 2);
        let total: usize = rows.iter().map(|r| r.peers.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_connection_records() {
        let local = NodeId::from("a");
        let mut dir = PeerDirectory::<u32>::new(local.clone());
        let first = ConnectionKey::generate();
        let second = ConnectionKey::generate();

        dir.register_connection(first, peer(1), 10);
        assert_eq!(dir.find_connection_by_peer(&peer(1)), Some(10));
        assert_eq!(dir.find_peers_by_connection(&first), vec![peer(1)]);

        // Reconnect of the same peer replaces the old connection.
        dir.register_connection(second, peer(1), 20);
        assert_eq!(dir.find_connection_by_peer(&peer(1)), Some(20));
        assert_eq!(dir.connection_count(), 1);

        assert!(dir.unregister_connection(&first).is_none());
        let record = dir.unregister_connection(&second).unwrap();
        assert_eq!(record.node, local);
        assert_eq!(dir.find_connection_by_peer(&peer(1)), None);
    }

    #[test]
    fn test_connection_carries_several_peers() {
        let mut dir = PeerDirectory::<u32>::new(NodeId::from("a"));
        let shared = ConnectionKey::generate();
        let other = ConnectionKey::generate();

        dir.register_connection(shared, peer(1), 10);
        dir.register_connection(shared, peer(2), 10);
        assert_eq!(dir.find_peers_by_connection(&shared), vec![peer(1), peer(2)]);
        assert_eq!(dir.find_connection_by_peer(&peer(1)), Some(10));

        // peer 2 moves to its own connection; the shared one keeps peer 1.
        dir.register_connection(other, peer(2), 20);
        assert_eq!(dir.find_peers_by_connection(&shared), vec![peer(1)]);
        assert_eq!(dir.connection_count(), 2);

        let record = dir.unregister_connection(&shared).unwrap();
        assert_eq!(record.peers.len(), 1);
        assert_eq!(dir.find_connection_by_peer(&peer(1)), None);
        assert_eq!(dir.find_connection_by_peer(&peer(2)), Some(20));
    }

    #[test]
    fn test_delete_peer_everywhere_and_unsubscribe() {
        let local = NodeId::from("a");
        let mut dir = PeerDirectory::<()>::new(local.clone());
        let events = recording(&mut dir);
        dir.add(topic("t"), &local, peer(1));
        dir.add(topic("u"), &local, peer(1));
        dir.add(topic("u"), &local, peer(2));

        assert_eq!(dir.delete_peer_everywhere(&local, &peer(1)), 2);
        assert_eq!(dir.peers(&topic("u")), vec![peer(2)]);
        assert_eq!(events.lock().unwrap().len(), 5);

        let id = dir.subscribe(Box::new(|_| panic!("unsubscribed observer called")));
        assert!(dir.unsubscribe(id));
        dir.add(topic("t"), &local, peer(3));
    }
}
