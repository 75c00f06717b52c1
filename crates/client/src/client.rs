//! The tether client: remote command execution over a shared daemon link

use std::sync::Arc;

use tether_core::error::Result;
use tether_core::io::RewindableSource;

use crate::config::ClientConfig;
use crate::exec::{self, ExecOutput, ExecStream};
use crate::link::SharedLink;
use crate::transport::Transport;

/// A host-side client for one daemon endpoint.
///
/// The underlying link is created lazily on the first command and shared by
/// concurrent commands; each command gets its own transport channel.
#[derive(Debug, Clone)]
pub struct TetherClient {
    link: SharedLink,
    config: ClientConfig,
}

impl TetherClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            link: SharedLink::new(transport, config.clone()),
            config,
        }
    }

    /// Runs `command` on the daemon, returning its output as a lazy stream.
    ///
    /// When `stdin` is supplied it is framed and forwarded concurrently with
    /// output collection, ending with a close-stdin signal at EOF. Dropping
    /// or cancelling the returned stream stops both activities and releases
    /// the shared link.
    pub async fn exec(
        &self,
        command: &str,
        stdin: Option<Box<dyn RewindableSource>>,
    ) -> Result<ExecStream> {
        let lease = self.link.lease().await?;
        let service = format!("shell,v2,raw:{command}");
        exec::start(lease, &service, stdin, self.config.buffer_size).await
    }

    /// Runs `command` and collects its complete output in memory.
    pub async fn exec_collect(
        &self,
        command: &str,
        stdin: Option<Box<dyn RewindableSource>>,
    ) -> Result<ExecOutput> {
        self.exec(command, stdin).await?.collect().await
    }

    /// Closes the shared link permanently. In-flight commands are cancelled.
    pub async fn close(&self) {
        self.link.close().await;
    }
}
