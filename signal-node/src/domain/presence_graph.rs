//! Topology view of node-to-node overlay links.
//!
//! Each edge is owned by the node that initiated the link. The local node's
//! edges are authoritative; a remote node's edges are replaced wholesale on
//! every accepted update from it.

use super::ids::NodeId;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;

/// Capacity of the last-seen timestamp table.
pub const LAST_UPDATE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self { source, target }
    }

    pub fn touches(&self, node: &NodeId) -> bool {
        self.source == *node || self.target == *node
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub owner: NodeId,
    pub nodes: Vec<NodeId>,
    pub edges: Vec<Edge>,
}

pub struct PresenceGraph {
    owner: NodeId,
    nodes: BTreeSet<NodeId>,
    edges: BTreeSet<Edge>,
    last_update: LruCache<NodeId, u64>,
}

impl PresenceGraph {
    pub fn new(owner: NodeId) -> Self {
        let mut nodes = BTreeSet::new();
        nodes.insert(owner.clone());
        let capacity = NonZeroUsize::new(LAST_UPDATE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            owner,
            nodes,
            edges: BTreeSet::new(),
            last_update: LruCache::new(capacity),
        }
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    pub fn add_node(&mut self, id: NodeId) -> bool {
        self.nodes.insert(id)
    }

    /// Drop a node and every edge touching it. The owner is permanent.
    pub fn delete_node(&mut self, id: &NodeId) -> bool {
        if *id == self.owner || !self.nodes.remove(id) {
            return false;
        }
        self.edges.retain(|edge| !edge.touches(id));
        true
    }

    /// Record a link to `peer`. The edge is ours when we dialed, otherwise it
    /// is provisionally attributed to `peer` until its own update arrives.
    pub fn add_connection(&mut self, initiator: bool, peer: NodeId) -> bool {
        self.nodes.insert(peer.clone());
        let edge = if initiator {
            Edge::new(self.owner.clone(), peer)
        } else {
            Edge::new(peer, self.owner.clone())
        };
        self.edges.insert(edge)
    }

    pub fn delete_connection(&mut self, initiator: bool, peer: &NodeId) -> bool {
        let edge = if initiator {
            Edge::new(self.owner.clone(), peer.clone())
        } else {
            Edge::new(peer.clone(), self.owner.clone())
        };
        self.edges.remove(&edge)
    }

    /// Move the edge to `peer` to the direction of the surviving connection.
    pub fn redirect_connection(&mut self, initiator: bool, peer: NodeId) -> bool {
        let removed = self.delete_connection(!initiator, &peer);
        self.add_connection(initiator, peer) || removed
    }

    /// Edges owned by the local node, the payload of `presence.update`.
    pub fn connections(&self) -> Vec<Edge> {
        self.edges_from(&self.owner)
    }

    pub fn edges_from(&self, node: &NodeId) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|edge| edge.source == *node)
            .cloned()
            .collect()
    }

    pub fn last_update(&self, id: &NodeId) -> Option<u64> {
        self.last_update.peek(id).copied()
    }

    /// Merge a remote node's edge set. Updates whose timestamp is not newer
    /// than the last one seen from `id` are discarded. Only edges sourced at
    /// `id` are imported. Returns true if the graph changed.
    pub fn update(&mut self, id: &NodeId, timestamp: u64, edges: Vec<Edge>) -> bool {
        if *id == self.owner {
            return false;
        }
        if self
            .last_update
            .get(id)
            .is_some_and(|last| timestamp <= *last)
        {
            return false;
        }
        self.last_update.put(id.clone(), timestamp);

        let mut changed = self.nodes.insert(id.clone());
        let previous: BTreeSet<Edge> = self
            .edges
            .iter()
            .filter(|edge| edge.source == *id)
            .cloned()
            .collect();
        let incoming: BTreeSet<Edge> = edges
            .into_iter()
            .filter(|edge| edge.source == *id && edge.target != *id)
            .collect();

        for edge in previous.difference(&incoming) {
            self.edges.remove(edge);
            changed = true;
        }
        for edge in incoming.difference(&previous) {
            self.nodes.insert(edge.target.clone());
            self.edges.insert(edge.clone());
            changed = true;
        }
        changed
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            owner: self.owner.clone(),
            nodes: self.nodes.iter().cloned().collect(),
            edges: self.edges.iter().cloned().collect(),
        }
    }
}

/// Monotonic timestamp source in microseconds. Never repeats or goes back,
/// even if the wall clock does.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: u64,
}

impl LogicalClock {
    pub fn tick(&mut self, now_micros: u64) -> u64 {
        self.last = now_micros.max(self.last + 1);
        self.last
    }
}
