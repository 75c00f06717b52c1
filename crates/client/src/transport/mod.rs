//! Transport abstraction for reaching a daemon endpoint
//!
//! The pipeline treats the transport as an external collaborator: something
//! that can produce bidirectional byte streams on demand. How those streams
//! are established (TCP, a local socket, an in-memory pair in tests) is none
//! of the pipeline's business.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use tether_core::Result;

pub mod tcp;

pub use tcp::TcpTransport;

/// Trait alias for the byte streams a transport hands out.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A way to open byte-stream connections to the daemon.
///
/// Each call to [`connect`](Self::connect) produces an independent stream;
/// the command pipeline opens one per command plus one control stream per
/// shared link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a fresh bidirectional stream to the daemon.
    async fn connect(&self) -> Result<Box<dyn TransportStream>>;

    /// Human-readable endpoint description for diagnostics.
    fn description(&self) -> String;
}
