//! Client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a tether client
///
/// Establishing a connection is bounded by an explicit deadline; running a
/// command is not, because a remote command may legitimately take forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Chunk size used when forwarding stdin and collecting output
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

// Default value functions
fn default_connect_timeout() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    8192
}
