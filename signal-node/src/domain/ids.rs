//! Identifiers shared by every layer of the signal node.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Protocol version mixed into the cluster topic so incompatible
/// deployments never share a mesh.
pub const SIGNAL_PROTOCOL_VERSION: u32 = 4;

const DISCOVERY_KEY_PREFIX: &[u8] = b"signal-discovery";

/// 32-byte rendezvous identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic([u8; 32]);

impl Topic {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a topic from a human readable name.
    pub fn from_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    /// Bind the topic to a protocol version: `sha256(hex(topic) || version)`.
    pub fn versioned(&self, version: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.to_hex().as_bytes());
        hasher.update(version.to_string().as_bytes());
        Self(hasher.finalize().into())
    }

    /// One-way key announced on the DHT. The topic itself never leaves the node.
    pub fn discovery_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_KEY_PREFIX);
        hasher.update(self.0);
        hasher.finalize().into()
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Topic::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Identity of a signal node inside the cluster.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing characters used in status output.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        self.0.get(start..).unwrap_or(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a client peer, opaque bytes rendered as hex.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PeerId({})", hex.get(..8).unwrap_or(&hex))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Handle for one client RPC connection (a WebSocket session).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnectionKey(Uuid);

impl ConnectionKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_hex_roundtrip() {
        let topic = Topic::from_name("#dxos");
        let parsed = Topic::from_hex(&topic.to_hex()).unwrap();
        assert_eq!(topic, parsed);
        assert!(Topic::from_hex("abcd").is_err());
    }

    #[test]
    fn test_versioned_topic_differs_per_version() {
        let base = Topic::from_name("room");
        assert_ne!(base.versioned(4), base.versioned(5));
        assert_eq!(base.versioned(4), base.versioned(4));
        assert_ne!(base.versioned(4), base);
    }

    #[test]
    fn test_discovery_key_hides_topic() {
        let topic = Topic::from_name("room");
        assert_ne!(&topic.discovery_key(), topic.as_bytes());
    }

    #[test]
    fn test_peer_id_serde_as_hex() {
        let peer = PeerId::new(vec![0xde, 0xad]);
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"dead\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_node_id_short() {
        assert_eq!(NodeId::from("abc").short(), "abc");
        assert_eq!(NodeId::from("0123456789abcdef").short(), "89abcdef");
    }
}
