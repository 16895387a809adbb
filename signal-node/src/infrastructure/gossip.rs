//! Flooding broadcast over the live set of node connections.
//!
//! `GossipTransport` does no I/O. It turns outgoing packets into frames
//! addressed to peers and classifies incoming frames, deciding what is
//! delivered locally and what is forwarded. The overlay owns the sockets.

use super::wire::{BroadcastEnvelope, Frame, Packet, WireError};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Time- and size-bounded set of message ids already seen.
pub struct DedupCache {
    entries: LruCache<[u8; 32], Instant>,
    max_age: Duration,
}

impl DedupCache {
    pub fn new(max_age: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age,
        }
    }

    /// Record `key` as seen. Returns false when it was seen within `max_age`.
    pub fn insert(&mut self, key: [u8; 32], now: Instant) -> bool {
        if let Some(seen) = self.entries.get(&key) {
            if now.saturating_duration_since(*seen) <= self.max_age {
                return false;
            }
        }
        self.entries.put(key, now);
        true
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<[u8; 32]> = self
            .entries
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.max_age)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

/// A frame to write to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound<P> {
    pub to: P,
    pub frame: Vec<u8>,
}

/// Classification of an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<P> {
    Direct(Packet),
    /// First sight of a broadcast: deliver it and forward `forward`.
    Broadcast {
        origin: Vec<u8>,
        packet: Packet,
        forward: Vec<Outbound<P>>,
    },
    /// A copy already seen, or our own message coming back.
    Duplicate,
    /// A broadcast from a peer outside the live set. Neither cached nor forwarded.
    Rejected,
}

pub struct GossipTransport<P> {
    local: Vec<u8>,
    seqno: u64,
    peers: BTreeSet<P>,
    cache: DedupCache,
}

impl<P: Clone + Ord> GossipTransport<P> {
    /// `local` is this node's identity as carried in broadcast envelopes.
    pub fn new(local: Vec<u8>) -> Self {
        Self::with_cache(local, DedupCache::new(DEFAULT_MAX_AGE, DEFAULT_MAX_ENTRIES))
    }

    pub fn with_cache(local: Vec<u8>, cache: DedupCache) -> Self {
        Self {
            local,
            seqno: 0,
            peers: BTreeSet::new(),
            cache,
        }
    }

    pub fn add_peer(&mut self, peer: P) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(&mut self, peer: &P) -> bool {
        self.peers.remove(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &P> {
        self.peers.iter()
    }

    pub fn has_peer(&self, peer: &P) -> bool {
        self.peers.contains(peer)
    }

    /// Frame `packet` for every current peer, once each.
    pub fn broadcast(&mut self, packet: Packet, now: Instant) -> Vec<Outbound<P>> {
        self.seqno += 1;
        let envelope = BroadcastEnvelope {
            origin: self.local.clone(),
            seqno: self.seqno,
            packet,
        };
        let frame = Frame::Broadcast(envelope).encode();
        if let Ok((_, payload)) = Frame::split(&frame) {
            self.cache.insert(message_id(payload), now);
        }
        self.fan_out(&frame, None)
    }

    /// Frame `packet` for one peer. `None` if the peer is not in the live set.
    pub fn direct(&self, to: &P, packet: Packet) -> Option<Outbound<P>> {
        if !self.peers.contains(to) {
            return None;
        }
        Some(Outbound {
            to: to.clone(),
            frame: Frame::Direct(packet).encode(),
        })
    }

    /// Classify a frame received from `from`. Broadcasts are only accepted
    /// from live peers. The dedup cache is consulted before local delivery
    /// and before forwarding.
    pub fn on_frame(&mut self, from: &P, bytes: &[u8], now: Instant) -> Result<Inbound<P>, WireError> {
        let (_, payload) = Frame::split(bytes)?;
        match Frame::decode(bytes)? {
            Frame::Direct(packet) => Ok(Inbound::Direct(packet)),
            Frame::Broadcast(_) if !self.peers.contains(from) => Ok(Inbound::Rejected),
            Frame::Broadcast(envelope) => {
                if !self.cache.insert(message_id(payload), now) || envelope.origin == self.local {
                    return Ok(Inbound::Duplicate);
                }
                Ok(Inbound::Broadcast {
                    origin: envelope.origin,
                    packet: envelope.packet,
                    forward: self.fan_out(bytes, Some(from)),
                })
            }
        }
    }

    pub fn prune(&mut self, now: Instant) -> usize {
        self.cache.prune(now)
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    fn fan_out(&self, frame: &[u8], except: Option<&P>) -> Vec<Outbound<P>> {
        self.peers
            .iter()
            .filter(|peer| Some(*peer) != except)
            .map(|peer| Outbound {
                to: peer.clone(),
                frame: frame.to_vec(),
            })
            .collect()
    }
}

/// Message id used for dedup: SHA-256 over the encoded envelope.
pub fn message_id(envelope: &[u8]) -> [u8; 32] {
    Sha256::digest(envelope).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, peers: &[u32]) -> GossipTransport<u32> {
        let mut gossip = GossipTransport::new(name.as_bytes().to_vec());
        for p in peers {
            gossip.add_peer(*p);
        }
        gossip
    }

    #[test]
    fn test_broadcast_reaches_every_peer_once() {
        let mut a = node("a", &[1, 2, 3]);
        let out = a.broadcast(Packet::new("t", b"x".to_vec()), Instant::now());
        let targets: Vec<u32> = out.iter().map(|o| o.to).collect();
        assert_eq!(targets, vec![1, 2, 3]);
    }

    #[test]
    fn test_broadcast_with_no_peers_is_empty() {
        let mut a = node("a", &[]);
        assert!(a.broadcast(Packet::new("t", vec![]), Instant::now()).is_empty());
    }

    #[test]
    fn test_duplicate_via_two_paths_delivers_once() {
        let now = Instant::now();
        let mut origin = node("a", &[1, 2]);
        let frame = origin.broadcast(Packet::new("t", b"x".to_vec()), now)[0].frame.clone();

        // Receiver hears the same message from two different neighbours.
        let mut receiver = node("r", &[10, 11, 12]);
        let first = receiver.on_frame(&10, &frame, now).unwrap();
        let second = receiver.on_frame(&11, &frame, now).unwrap();

        match first {
            Inbound::Broadcast { packet, forward, origin } => {
                assert_eq!(packet.data, b"x");
                assert_eq!(origin, b"a");
                let targets: Vec<u32> = forward.iter().map(|o| o.to).collect();
                assert_eq!(targets, vec![11, 12]);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
        assert_eq!(second, Inbound::Duplicate);
    }

    #[test]
    fn test_own_broadcast_echo_is_dropped() {
        let now = Instant::now();
        let mut a = node("a", &[1]);
        let frame = a.broadcast(Packet::new("t", vec![]), now)[0].frame.clone();
        assert_eq!(a.on_frame(&1, &frame, now).unwrap(), Inbound::Duplicate);
    }

    #[test]
    fn test_same_payload_new_seqno_is_new_message() {
        let now = Instant::now();
        let mut a = node("a", &[1]);
        let mut r = node("r", &[9]);
        let f1 = a.broadcast(Packet::new("t", b"same".to_vec()), now)[0].frame.clone();
        let f2 = a.broadcast(Packet::new("t", b"same".to_vec()), now)[0].frame.clone();
        assert!(matches!(r.on_frame(&9, &f1, now).unwrap(), Inbound::Broadcast { .. }));
        assert!(matches!(r.on_frame(&9, &f2, now).unwrap(), Inbound::Broadcast { .. }));
    }

    #[test]
    fn test_broadcast_from_outside_live_set_is_rejected() {
        let now = Instant::now();
        let mut outsider = node("x", &[1]);
        let frame = outsider.broadcast(Packet::new("t", b"x".to_vec()), now)[0].frame.clone();

        let mut receiver = node("r", &[10, 11]);
        assert_eq!(receiver.on_frame(&99, &frame, now).unwrap(), Inbound::Rejected);
        assert!(receiver.cache().is_empty());

        // Once the sender is live the same frame is still fresh.
        receiver.add_peer(99);
        assert!(matches!(
            receiver.on_frame(&99, &frame, now).unwrap(),
            Inbound::Broadcast { .. }
        ));
    }

    #[test]
    fn test_direct_requires_live_peer() {
        let mut a = node("a", &[1]);
        assert!(a.direct(&1, Packet::new("rpc", vec![])).is_some());
        assert!(a.direct(&2, Packet::new("rpc", vec![])).is_none());
        a.remove_peer(&1);
        assert!(a.direct(&1, Packet::new("rpc", vec![])).is_none());
    }

    #[test]
    fn test_cache_expires_and_prunes() {
        let start = Instant::now();
        let mut cache = DedupCache::new(Duration::from_secs(30), 100);
        assert!(cache.insert([1; 32], start));
        assert!(!cache.insert([1; 32], start + Duration::from_secs(10)));
        assert!(cache.insert([1; 32], start + Duration::from_secs(41)));

        cache.insert([2; 32], start);
        assert_eq!(cache.prune(start + Duration::from_secs(45)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_is_size_bounded() {
        let now = Instant::now();
        let mut cache = DedupCache::new(Duration::from_secs(30), 2);
        cache.insert([1; 32], now);
        cache.insert([2; 32], now);
        cache.insert([3; 32], now);
        assert_eq!(cache.len(), 2);
    }
}
