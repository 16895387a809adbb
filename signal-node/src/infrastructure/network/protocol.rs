//! Request-response codec carrying raw wire frames between nodes.
//!
//! Each request and response is one frame, prefixed by its length as a
//! varint. An empty response acknowledges a frame that needs no answer.

use crate::infrastructure::wire::{decode_varint, encode_varint};
use async_trait::async_trait;
use futures::prelude::*;
use libp2p::StreamProtocol;
use std::io;

/// Maximum frame size (16 MB) to prevent memory exhaustion.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol name for node-to-node frames.
pub const MESSENGER_PROTOCOL: &str = "/signal-mesh/messenger/1.0.0";

/// Protocol name for the Kademlia DHT used for rendezvous.
pub const KAD_PROTOCOL: &str = "/signal-mesh/kad/1.0.0";

#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

#[async_trait]
impl libp2p::request_response::Codec for FrameCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_length_prefixed(io).await
    }

    async fn read_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_length_prefixed(io).await
    }

    async fn write_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_length_prefixed(io, &req).await
    }

    async fn write_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_length_prefixed(io, &res).await
    }
}

async fn read_length_prefixed<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(4);
    let len = loop {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        header.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            let (len, _) = decode_varint(&header)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            break len;
        }
        if header.len() >= 10 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "length prefix too long"));
        }
    };

    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_length_prefixed<T: AsyncWrite + Unpin>(io: &mut T, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large to send: {} bytes (max {})", data.len(), MAX_FRAME_SIZE),
        ));
    }
    let mut header = Vec::with_capacity(4);
    encode_varint(data.len() as u64, &mut header);
    io.write_all(&header).await?;
    io.write_all(data).await?;
    io.close().await?;
    Ok(())
}
