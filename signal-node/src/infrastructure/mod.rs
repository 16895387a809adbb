//! Infrastructure layer - wire codec, gossip flooding and the libp2p overlay.

pub mod debounce;
pub mod gossip;
pub mod network;
pub mod wire;

pub use debounce::{DebounceHandle, Debouncer};
pub use gossip::{DedupCache, GossipTransport, Inbound, Outbound};
pub use wire::{BroadcastEnvelope, Frame, Packet, WireError};
