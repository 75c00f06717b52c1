//! The shared, reference-counted link to a daemon
//!
//! Opening a link is expensive (connection establishment, bounded by the
//! configured deadline), so concurrent commands share one [`DaemonLink`]
//! through a [`RefCountedResource`]: the first command brings the link up,
//! the last one to finish tears it down. [`LinkLease`] ties each acquisition
//! to exactly one release, even on cancellation paths.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use tether_core::error::{Error, Result};
use tether_core::sync::{AutoShutdown, RefCountedResource};

use crate::config::ClientConfig;
use crate::transport::{Transport, TransportStream};

/// A live link to the daemon.
///
/// Holds a control stream that keeps the daemon session alive and opens an
/// independent channel per command.
pub struct DaemonLink {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    control: tokio::sync::Mutex<Option<Box<dyn TransportStream>>>,
}

impl DaemonLink {
    /// Brings the link up within the configured connect deadline.
    async fn establish(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        let control = timeout(config.connect_timeout(), transport.connect())
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", transport.description()),
                ))
            })??;
        debug!("daemon link established via {}", transport.description());
        Ok(Self {
            transport,
            config,
            control: tokio::sync::Mutex::new(Some(control)),
        })
    }

    /// Opens a fresh channel for one command.
    pub async fn open_channel(&self) -> Result<Box<dyn TransportStream>> {
        timeout(self.config.connect_timeout(), self.transport.connect())
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("opening a channel to {} timed out", self.transport.description()),
                ))
            })?
    }

    pub fn description(&self) -> String {
        self.transport.description()
    }
}

#[async_trait]
impl AutoShutdown for DaemonLink {
    /// Best-effort goodbye: half-close the control stream so the daemon sees
    /// an orderly EOF before the link is dropped.
    async fn shutdown(&self) -> Result<()> {
        if let Some(control) = self.control.lock().await.as_mut() {
            control.shutdown().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.control.lock().await.take();
    }
}

impl std::fmt::Debug for DaemonLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonLink")
            .field("endpoint", &self.transport.description())
            .finish()
    }
}

/// Lazily-created, reference-counted access to a [`DaemonLink`].
#[derive(Clone)]
pub struct SharedLink {
    resource: RefCountedResource<DaemonLink>,
}

impl SharedLink {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let resource = RefCountedResource::new(move || {
            let transport = Arc::clone(&transport);
            let config = config.clone();
            async move { DaemonLink::establish(transport, config).await }
        });
        Self { resource }
    }

    /// Acquires the link, creating it on first demand.
    pub async fn lease(&self) -> Result<LinkLease> {
        let link = self.resource.retain().await?;
        Ok(LinkLease {
            link,
            resource: self.resource.clone(),
            released: false,
        })
    }

    /// Closes the link permanently, cancelling pending acquisitions.
    pub async fn close(&self) {
        self.resource.close().await;
    }
}

impl std::fmt::Debug for SharedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLink")
            .field("resource", &self.resource)
            .finish()
    }
}

/// One acquisition of the shared link.
///
/// Release it explicitly to observe teardown errors; if the lease is simply
/// dropped (a cancelled pipeline, a panic) the release still happens on a
/// detached task, so the link can never leak a reference.
pub struct LinkLease {
    link: Arc<DaemonLink>,
    resource: RefCountedResource<DaemonLink>,
    released: bool,
}

impl LinkLease {
    pub fn link(&self) -> &DaemonLink {
        &self.link
    }

    /// Releases the lease, surfacing any teardown error to this caller.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.resource.release(&self.link).await
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        if !self.released {
            let resource = self.resource.clone();
            let link = Arc::clone(&self.link);
            tokio::spawn(async move {
                if let Err(error) = resource.release(&link).await {
                    if !error.is_cancelled() {
                        warn!("releasing a dropped link lease failed: {error}");
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for LinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLease")
            .field("released", &self.released)
            .finish()
    }
}
