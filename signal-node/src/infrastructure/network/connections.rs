//! Per-node connection state and duplicate-connection resolution.
//!
//! Each remote node moves through `Connecting -> Handshaking -> Open`, and
//! leaves the table once its last connection closes.
//!
//! Duplicate rule: when two connections to the same node are live, the one
//! dialed by the lexicographically smaller node id survives. If both were
//! dialed by the same side, the older one survives. The losing connection is
//! closed by the side that dialed it, so exactly one side acts and both
//! sides agree on the survivor.

use libp2p::{swarm::ConnectionId, PeerId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    id: ConnectionId,
    local_dialed: bool,
}

#[derive(Debug)]
struct PeerEntry {
    state: LinkState,
    /// Direction of the surviving connection. Reported with connect/disconnect events.
    initiator: bool,
    links: Vec<Link>,
}

/// What the overlay should do with a freshly established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First connection to this node. Start the handshake if we dialed.
    Handshake { initiator: bool },
    /// Second connection to an already connected node. `redirected` carries
    /// the new initiator flag when the survivor flipped direction on an open node.
    Duplicate {
        close: Option<ConnectionId>,
        redirected: Option<bool>,
    },
}

/// Reported when the last connection to a node goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub was_open: bool,
    pub initiator: bool,
}

pub struct ConnectionTable {
    local: PeerId,
    peers: HashMap<PeerId, PeerEntry>,
}

impl ConnectionTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn dialing(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_insert(PeerEntry {
            state: LinkState::Connecting,
            initiator: true,
            links: Vec::new(),
        });
    }

    pub fn on_dial_failed(&mut self, peer: &PeerId) {
        if self
            .peers
            .get(peer)
            .is_some_and(|entry| entry.links.is_empty())
        {
            self.peers.remove(peer);
        }
    }

    pub fn on_established(&mut self, peer: PeerId, id: ConnectionId, local_dialed: bool) -> Admission {
        let link = Link { id, local_dialed };
        let entry = self.peers.entry(peer).or_insert(PeerEntry {
            state: LinkState::Connecting,
            initiator: local_dialed,
            links: Vec::new(),
        });

        let Some(current) = entry.links.first().copied() else {
            entry.links.push(link);
            entry.state = LinkState::Handshaking;
            entry.initiator = local_dialed;
            return Admission::Handshake {
                initiator: local_dialed,
            };
        };

        entry.links.push(link);
        let loser = if current.local_dialed == link.local_dialed {
            link
        } else {
            let local_is_smaller = self.local.to_bytes() < peer.to_bytes();
            // The surviving connection is the one whose dialer has the smaller id.
            let keep_local_dialed = local_is_smaller;
            if current.local_dialed == keep_local_dialed {
                link
            } else {
                current
            }
        };

        let mut redirected = None;
        if loser.id == current.id {
            // Keep the newer link first so subsequent duplicates compare against the survivor.
            entry.links.retain(|l| l.id != link.id);
            entry.links.insert(0, link);
            if entry.initiator != link.local_dialed {
                entry.initiator = link.local_dialed;
                if entry.state == LinkState::Open {
                    redirected = Some(link.local_dialed);
                }
            }
        }

        Admission::Duplicate {
            close: loser.local_dialed.then_some(loser.id),
            redirected,
        }
    }

    /// Handshake succeeded. Returns the initiator flag if this opened the node.
    pub fn on_handshake_complete(&mut self, peer: &PeerId) -> Option<bool> {
        let entry = self.peers.get_mut(peer)?;
        if entry.links.is_empty() || entry.state == LinkState::Open {
            return None;
        }
        entry.state = LinkState::Open;
        Some(entry.initiator)
    }

    /// Forget a closed connection. Returns `Some` when it was the node's last one.
    pub fn on_closed(&mut self, peer: &PeerId, id: ConnectionId) -> Option<Departure> {
        let entry = self.peers.get_mut(peer)?;
        entry.links.retain(|link| link.id != id);
        if !entry.links.is_empty() {
            return None;
        }
        let entry = self.peers.remove(peer)?;
        Some(Departure {
            was_open: entry.state == LinkState::Open,
            initiator: entry.initiator,
        })
    }

    pub fn state(&self, peer: &PeerId) -> Option<LinkState> {
        self.peers.get(peer).map(|entry| entry.state)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(LinkState::Open)
    }

    pub fn is_known(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn open_nodes(&self) -> Vec<(PeerId, bool)> {
        let mut nodes: Vec<(PeerId, bool)> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::Open)
            .map(|(peer, entry)| (*peer, entry.initiator))
            .collect();
        nodes.sort();
        nodes
    }

    pub fn connection_count(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |entry| entry.links.len())
    }
}
