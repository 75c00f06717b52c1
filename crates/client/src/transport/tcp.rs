//! TCP transport implementation

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use tether_core::Result;

use crate::transport::{Transport, TransportStream};

/// Connects to a daemon listening on a TCP endpoint.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<Box<dyn TransportStream>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        // Packets are small and latency-sensitive; don't batch them.
        stream.set_nodelay(true)?;
        debug!("connected to daemon at {}:{}", self.host, self.port);
        Ok(Box::new(stream))
    }

    fn description(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
