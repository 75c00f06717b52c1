//! Byte sources that can be consumed once and logically rewound
//!
//! A [`RewindableSource`] reads forward-only, but can reset its cursor to the
//! start: bytes already consumed from a live stream are transparently
//! recorded and replayed, falling through to the stream only for bytes not
//! yet read. [`RewindableSource::to_offline`] produces a fully-materialized,
//! disconnected copy of the whole source.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Default chunk size used when draining a source through a scratch buffer.
const DRAIN_CHUNK: usize = 8 * 1024;

/// A byte source that can be fully consumed and then rewound.
///
/// The trait ships a generic `to_offline` that drains the source through the
/// ordinary read+rewind contract; implementations with direct access to their
/// backing bytes override it to avoid the extra copy.
#[async_trait]
pub trait RewindableSource: Send {
    /// Reads up to `buf.len()` bytes into `buf`. `Ok(0)` means end of source.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Resets the read cursor to the start of the source.
    ///
    /// Fails with an illegal-state error once the source is closed.
    async fn rewind(&mut self) -> Result<()>;

    /// Releases the underlying source. Further reads and rewinds fail.
    async fn close(&mut self) -> Result<()>;

    /// Produces a fully-materialized, disconnected copy of the source.
    ///
    /// The generic path rewinds and drains everything through `read` into a
    /// fresh buffer, using `work` as scratch space.
    async fn to_offline(&mut self, work: &mut BytesMut) -> Result<BufferSource> {
        self.rewind().await?;
        if work.len() < DRAIN_CHUNK {
            work.resize(DRAIN_CHUNK, 0);
        }
        let mut data = BytesMut::new();
        loop {
            let count = self.read(&mut work[..]).await?;
            if count == 0 {
                break;
            }
            data.extend_from_slice(&work[..count]);
        }
        Ok(BufferSource::new(data.freeze()))
    }
}

/// Drains `source` to its end, returning everything read.
pub async fn read_remaining<S: RewindableSource + ?Sized>(source: &mut S) -> Result<BytesMut> {
    let mut chunk = [0u8; DRAIN_CHUNK];
    let mut out = BytesMut::new();
    loop {
        let count = source.read(&mut chunk).await?;
        if count == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..count]);
    }
}

/// An in-memory source backed by a fully-materialized buffer.
///
/// Reads never record (there is nothing to record); `to_offline` is a cheap
/// reference-counted clone of the backing bytes.
#[derive(Debug, Clone)]
pub struct BufferSource {
    data: Bytes,
    pos: usize,
    closed: bool,
}

impl BufferSource {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            closed: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::illegal_state("byte source is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RewindableSource for BufferSource {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let remaining = &self.data[self.pos..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.pos += count;
        Ok(count)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pos = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    async fn to_offline(&mut self, _work: &mut BytesMut) -> Result<BufferSource> {
        self.ensure_open()?;
        // Fast path: the backing buffer already is the offline copy.
        Ok(BufferSource::new(self.data.clone()))
    }
}

/// A source backed by a one-shot live stream.
///
/// Bytes are recorded as they are read so a later rewind can replay them;
/// reads past the recorded region pull from the live stream again.
pub struct RecordingSource<R> {
    stream: Option<R>,
    recorded: BytesMut,
    /// Cursor into the logical byte sequence; at `recorded.len()` the next
    /// read goes to the live stream.
    pos: usize,
    stream_eof: bool,
    closed: bool,
}

impl<R: AsyncRead + Unpin + Send> RecordingSource<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream: Some(stream),
            recorded: BytesMut::new(),
            pos: 0,
            stream_eof: false,
            closed: false,
        }
    }

    /// Number of bytes recorded from the live stream so far.
    pub fn recorded_len(&self) -> usize {
        self.recorded.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::illegal_state("byte source is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RewindableSource for RecordingSource<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        // Replay previously recorded bytes first.
        if self.pos < self.recorded.len() {
            let remaining = &self.recorded[self.pos..];
            let count = remaining.len().min(buf.len());
            buf[..count].copy_from_slice(&remaining[..count]);
            self.pos += count;
            return Ok(count);
        }

        if self.stream_eof {
            return Ok(0);
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(Error::illegal_state("byte source is closed")),
        };
        let count = stream.read(buf).await?;
        if count == 0 {
            self.stream_eof = true;
            return Ok(0);
        }
        self.recorded.extend_from_slice(&buf[..count]);
        self.pos += count;
        Ok(count)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pos = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.closed = true;
        Ok(())
    }

    async fn to_offline(&mut self, work: &mut BytesMut) -> Result<BufferSource> {
        self.ensure_open()?;
        // Finish draining the live stream into the recording, then build the
        // copy directly from the recorded bytes.
        if !self.stream_eof {
            if work.len() < DRAIN_CHUNK {
                work.resize(DRAIN_CHUNK, 0);
            }
            let saved = self.pos;
            self.pos = self.recorded.len();
            loop {
                let count = self.read(&mut work[..]).await?;
                if count == 0 {
                    break;
                }
            }
            self.pos = saved;
        }
        Ok(BufferSource::new(Bytes::copy_from_slice(&self.recorded)))
    }
}

impl<R> std::fmt::Debug for RecordingSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSource")
            .field("recorded", &self.recorded.len())
            .field("pos", &self.pos)
            .field("stream_eof", &self.stream_eof)
            .finish()
    }
}
