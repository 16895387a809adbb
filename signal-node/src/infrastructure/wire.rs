//! Binary framing for messages exchanged over node connections.
//!
//! ```text
//! frame     = varint(attr) payload
//! attr      = 1 (direct) | 4 (broadcast)
//! direct    : payload = packet
//! broadcast : payload = varint(len(origin)) origin varint(seqno) packet
//! packet    = varint(len(topic)) utf8(topic) data
//! ```
//!
//! Varints are unsigned LEB128.

use crate::domain::SignalError;
use thiserror::Error;

pub const ATTR_DIRECT: u64 = 1;
pub const ATTR_BROADCAST: u64 = 1 << 2;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("topic is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown frame attribute {0}")]
    UnknownAttribute(u64),
}

impl From<WireError> for SignalError {
    fn from(e: WireError) -> Self {
        SignalError::InvalidMessage(e.to_string())
    }
}

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint from the front of `bytes`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), WireError> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(WireError::VarintOverflow);
        }
        let chunk = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(WireError::VarintOverflow);
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(WireError::Truncated)
}

fn take<'a>(bytes: &'a [u8], len: u64) -> Result<(&'a [u8], &'a [u8]), WireError> {
    let len = usize::try_from(len).map_err(|_| WireError::Truncated)?;
    if bytes.len() < len {
        return Err(WireError::Truncated);
    }
    Ok(bytes.split_at(len))
}

/// Topic-labelled payload, the unit delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub topic: String,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_varint(self.topic.len() as u64, buf);
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (len, used) = decode_varint(bytes)?;
        let (topic, data) = take(&bytes[used..], len)?;
        let topic = std::str::from_utf8(topic).map_err(|_| WireError::InvalidUtf8)?;
        Ok(Self {
            topic: topic.to_string(),
            data: data.to_vec(),
        })
    }
}

/// Broadcast payload: the packet plus the identity needed for dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEnvelope {
    pub origin: Vec<u8>,
    pub seqno: u64,
    pub packet: Packet,
}

impl BroadcastEnvelope {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_varint(self.origin.len() as u64, buf);
        buf.extend_from_slice(&self.origin);
        encode_varint(self.seqno, buf);
        self.packet.encode_into(buf);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (len, used) = decode_varint(bytes)?;
        let (origin, rest) = take(&bytes[used..], len)?;
        let (seqno, used) = decode_varint(rest)?;
        Ok(Self {
            origin: origin.to_vec(),
            seqno,
            packet: Packet::decode(&rest[used..])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Direct(Packet),
    Broadcast(BroadcastEnvelope),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Frame::Direct(packet) => {
                encode_varint(ATTR_DIRECT, &mut buf);
                packet.encode_into(&mut buf);
            }
            Frame::Broadcast(envelope) => {
                encode_varint(ATTR_BROADCAST, &mut buf);
                envelope.encode_into(&mut buf);
            }
        }
        buf
    }

    /// Split a frame into its attribute and raw payload.
    pub fn split(bytes: &[u8]) -> Result<(u64, &[u8]), WireError> {
        let (attr, used) = decode_varint(bytes)?;
        Ok((attr, &bytes[used..]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (attr, payload) = Self::split(bytes)?;
        if attr & ATTR_BROADCAST != 0 {
            Ok(Frame::Broadcast(BroadcastEnvelope::decode(payload)?))
        } else if attr & ATTR_DIRECT != 0 {
            Ok(Frame::Direct(Packet::decode(payload)?))
        } else {
            Err(WireError::UnknownAttribute(attr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            assert_eq!(decode_varint(&buf).unwrap(), (value, buf.len()));
        }
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xac, 0x02]);
    }

    #[test]
    fn test_varint_errors() {
        assert_eq!(decode_varint(&[]), Err(WireError::Truncated));
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(WireError::Truncated));
        assert_eq!(decode_varint(&[0xff; 11]), Err(WireError::VarintOverflow));
    }

    #[test]
    fn test_direct_frame_layout() {
        let frame = Frame::Direct(Packet::new("rpc", b"hi".to_vec()));
        assert_eq!(frame.encode(), vec![1, 3, b'r', b'p', b'c', b'h', b'i']);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_broadcast_frame_decodes() {
        let frame = Frame::Broadcast(BroadcastEnvelope {
            origin: vec![7; 3],
            seqno: 42,
            packet: Packet::new("presence", vec![]),
        });
        let bytes = frame.encode();
        assert_eq!(bytes[0], ATTR_BROADCAST as u8);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(Frame::decode(&[2, 0]), Err(WireError::UnknownAttribute(2)));
        // topic length larger than the remaining bytes
        assert_eq!(Frame::decode(&[1, 9, b'a']), Err(WireError::Truncated));
        assert_eq!(Frame::decode(&[1, 1, 0xff]), Err(WireError::InvalidUtf8));
    }
}
