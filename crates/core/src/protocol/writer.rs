//! Frame encoder for the streaming shell sub-protocol

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::protocol::packet::{HEADER_LEN, MAX_PAYLOAD, PacketKind};

/// Encodes length-prefixed packets onto an output stream.
///
/// The writer supports streaming payloads whose size is not known up front:
/// [`prepare`](Self::prepare) reserves header space in the internal buffer,
/// the caller writes payload bytes directly after it, and
/// [`commit`](Self::commit) patches the length prefix retroactively before
/// flushing the frame. This avoids copying payloads through a temporary.
pub struct FrameWriter<W> {
    stream: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Clears the frame buffer and reserves space for the packet header.
    ///
    /// Everything appended after the reserved bytes becomes the payload of
    /// the next [`commit`](Self::commit).
    pub fn prepare(&mut self) -> &mut BytesMut {
        self.buf.clear();
        self.buf.resize(HEADER_LEN, 0);
        &mut self.buf
    }

    /// The buffer previously set up by [`prepare`](Self::prepare).
    pub fn prepared_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Patches the header around the prepared payload and writes the frame.
    pub async fn commit(&mut self, kind: PacketKind) -> Result<()> {
        debug_assert!(self.buf.len() >= HEADER_LEN, "commit without prepare");
        let payload_len = (self.buf.len() - HEADER_LEN) as u64;
        if payload_len > u64::from(MAX_PAYLOAD) {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len.min(u64::from(u32::MAX)) as u32,
                max: MAX_PAYLOAD,
            }
            .into());
        }
        let payload_len = payload_len as u32;

        self.buf[0] = kind.to_wire();
        self.buf[1..HEADER_LEN].copy_from_slice(&payload_len.to_le_bytes());
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        self.buf.clear();
        Ok(())
    }

    /// Writes one packet with an already-materialized payload.
    pub async fn write_packet(&mut self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        self.prepare().extend_from_slice(payload);
        self.commit(kind).await
    }

    /// Half-closes the underlying stream's write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.stream
    }

    pub fn into_inner(self) -> W {
        self.stream
    }
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("buffered", &self.buf.len())
            .finish()
    }
}
