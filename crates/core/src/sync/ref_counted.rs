//! Lazily-created, reference-counted shared resources
//!
//! [`RefCountedResource`] builds an expensive value on first demand, hands the
//! same instance to every concurrent caller, and tears it down when the last
//! reference is released. Teardown is the two-step [`AutoShutdown`] sequence:
//! a best-effort asynchronous `shutdown` notification followed by an
//! unconditional `close`. Once started, that sequence always runs to
//! completion, even when the task driving it is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ResourceError, Result};

/// Two-step asynchronous teardown of a shared resource.
#[async_trait]
pub trait AutoShutdown: Send + Sync + 'static {
    /// Best-effort teardown notification. May fail; failure never prevents
    /// [`AutoShutdown::close`] from running.
    async fn shutdown(&self) -> Result<()>;

    /// Unconditional release of the underlying resource.
    async fn close(&self);
}

type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type Factory<T> = dyn Fn() -> FactoryFuture<T> + Send + Sync;

/// Lazy, on-demand construction of a shared resource keyed by a
/// retain/release protocol.
///
/// The first [`retain`](Self::retain) invokes the creation function; callers
/// arriving while creation is in flight await and share its single outcome.
/// Each successful retain must be paired with exactly one
/// [`release`](Self::release); the release that drops the count to zero runs
/// the shutdown+dispose sequence. [`close`](Self::close) is terminal.
///
/// Cloning the handle shares the same underlying resource.
pub struct RefCountedResource<T: AutoShutdown> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    factory: Box<Factory<T>>,
    state: Mutex<Slot<T>>,
    /// Trips on `close()`; aborts in-flight creation and shutdown.
    closed: CancellationToken,
}

enum Slot<T> {
    Empty,
    Creating(Attempt),
    Ready { value: Arc<T>, ref_count: usize },
    Closed,
}

/// One creation attempt. Every retain blocked on the attempt holds a clone
/// and observes the same outcome.
#[derive(Clone)]
struct Attempt {
    outcome: watch::Receiver<Option<AttemptOutcome>>,
}

#[derive(Clone)]
enum AttemptOutcome {
    Created,
    Failed(Arc<Error>),
    Cancelled,
}

impl Attempt {
    async fn wait(mut self) -> AttemptOutcome {
        loop {
            let outcome = self.outcome.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                // Driver task dropped its sender without reporting; only
                // possible if the attempt was torn down mid-flight.
                return AttemptOutcome::Cancelled;
            }
        }
    }
}

impl<T: AutoShutdown> RefCountedResource<T> {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(move || Box::pin(factory())),
                state: Mutex::new(Slot::Empty),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Acquires a reference to the shared value, creating it if necessary.
    ///
    /// Concurrent callers share a single creation attempt; a creation failure
    /// is reported to every caller awaiting that attempt and is not cached,
    /// so the next `retain` re-invokes the creation function. Fails with
    /// [`Error::Cancelled`] once the resource is closed.
    pub async fn retain(&self) -> Result<Arc<T>> {
        loop {
            enum Pending {
                Existing(Attempt),
                Fresh(Attempt, watch::Sender<Option<AttemptOutcome>>),
            }

            let pending = {
                let mut slot = self.inner.state.lock().unwrap();
                match &mut *slot {
                    Slot::Closed => return Err(Error::Cancelled),
                    Slot::Ready { value, ref_count } => {
                        *ref_count += 1;
                        return Ok(Arc::clone(value));
                    }
                    Slot::Creating(attempt) => Pending::Existing(attempt.clone()),
                    Slot::Empty => {
                        let (tx, rx) = watch::channel(None);
                        let attempt = Attempt { outcome: rx };
                        *slot = Slot::Creating(attempt.clone());
                        Pending::Fresh(attempt, tx)
                    }
                }
            };

            let attempt = match pending {
                Pending::Existing(attempt) => attempt,
                Pending::Fresh(attempt, tx) => {
                    spawn_creation(Arc::clone(&self.inner), tx);
                    attempt
                }
            };

            match attempt.wait().await {
                // Loop back to take a reference; the value may already have
                // been released again, in which case a new attempt starts.
                AttemptOutcome::Created => continue,
                AttemptOutcome::Failed(error) => {
                    return Err(ResourceError::CreationFailed(error).into());
                }
                AttemptOutcome::Cancelled => return Err(Error::Cancelled),
            }
        }
    }

    /// Releases one reference previously acquired with [`retain`](Self::retain).
    ///
    /// The release that drops the count to zero runs `shutdown` followed
    /// unconditionally by `close` on the instance. The sequence is shielded:
    /// cancelling the task blocked on `release` does not stop it. A shutdown
    /// failure is returned to this caller only and never cached.
    pub async fn release(&self, value: &Arc<T>) -> Result<()> {
        let teardown = {
            let mut slot = self.inner.state.lock().unwrap();
            match &mut *slot {
                Slot::Closed => return Err(Error::Cancelled),
                Slot::Ready {
                    value: current,
                    ref_count,
                } => {
                    if !Arc::ptr_eq(current, value) {
                        return Err(Error::illegal_state(
                            "released instance is not the live resource value",
                        ));
                    }
                    if *ref_count == 0 {
                        return Err(Error::illegal_state("release without a matching retain"));
                    }
                    *ref_count -= 1;
                    if *ref_count == 0 {
                        let value = Arc::clone(current);
                        *slot = Slot::Empty;
                        Some(value)
                    } else {
                        None
                    }
                }
                Slot::Empty | Slot::Creating(_) => {
                    return Err(Error::illegal_state("release without a matching retain"));
                }
            }
        };

        match teardown {
            Some(value) => self.teardown(value).await,
            None => Ok(()),
        }
    }

    /// Retains the value, runs `action` on it, and releases it on every path,
    /// including failure of `action` and cancellation of the calling task.
    pub async fn with_resource<R, F, Fut>(&self, action: F) -> Result<R>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let value = self.retain().await?;
        let mut guard = ReleaseGuard {
            resource: self.clone(),
            value: Some(Arc::clone(&value)),
        };

        let result = action(value).await;

        let release_result = match guard.value.take() {
            Some(value) => self.release(&value).await,
            None => Ok(()),
        };
        match result {
            Ok(output) => release_result.map(|_| output),
            // A release error must not mask the action's own failure.
            Err(error) => {
                if let Err(release_error) = release_result {
                    if !release_error.is_cancelled() {
                        warn!("release after failed action also failed: {release_error}");
                    }
                }
                Err(error)
            }
        }
    }

    /// Closes the resource permanently.
    ///
    /// Cancels any retain blocked on an in-flight creation (the aborted
    /// attempt never counts as created), disposes a ready instance exactly
    /// once, aborts an in-flight shutdown (its dispose step still runs), and
    /// makes every later retain/release fail with [`Error::Cancelled`].
    pub async fn close(&self) {
        let value = {
            let mut slot = self.inner.state.lock().unwrap();
            match std::mem::replace(&mut *slot, Slot::Closed) {
                Slot::Ready { value, .. } => Some(value),
                _ => None,
            }
        };
        self.inner.closed.cancel();

        if let Some(value) = value {
            debug!("closing reference-counted resource with a live instance");
            let handle = tokio::spawn(async move { dispose(value).await });
            let _ = handle.await;
        }
    }

    /// Drives the shutdown+dispose sequence on a detached task so that, once
    /// started, it always completes even if this caller is cancelled. Only
    /// the resource's own `close()` can abort the shutdown step; the dispose
    /// step is unconditional.
    async fn teardown(&self, value: Arc<T>) -> Result<()> {
        let closed = self.inner.closed.clone();
        let handle = tokio::spawn(async move {
            let shutdown_result = tokio::select! {
                _ = closed.cancelled() => Err(Error::Cancelled),
                result = value.shutdown() => result.map_err(|error| {
                    Error::Resource(ResourceError::ShutdownFailed(Box::new(error)))
                }),
            };
            value.close().await;
            shutdown_result
        });
        handle.await.unwrap_or_else(|error| {
            Err(Error::internal(format!(
                "resource teardown task failed: {error}"
            )))
        })
    }
}

impl<T: AutoShutdown> Clone for RefCountedResource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: AutoShutdown> std::fmt::Debug for RefCountedResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.state.lock().unwrap();
        let state = match &*slot {
            Slot::Empty => "empty",
            Slot::Creating(_) => "creating",
            Slot::Ready { .. } => "ready",
            Slot::Closed => "closed",
        };
        f.debug_struct("RefCountedResource")
            .field("state", &state)
            .finish()
    }
}

/// Spawns the task that drives one creation attempt. Running it detached
/// keeps creation alive when the retain that started it is cancelled:
/// other callers may still be waiting on the same attempt.
fn spawn_creation<T: AutoShutdown>(
    inner: Arc<Inner<T>>,
    tx: watch::Sender<Option<AttemptOutcome>>,
) {
    tokio::spawn(async move {
        let created = tokio::select! {
            _ = inner.closed.cancelled() => None,
            result = (inner.factory)() => Some(result),
        };

        let (outcome, orphan) = {
            let mut slot = inner.state.lock().unwrap();
            match created {
                None => (AttemptOutcome::Cancelled, None),
                Some(Ok(value)) => {
                    let value = Arc::new(value);
                    if matches!(&*slot, Slot::Creating(_)) {
                        *slot = Slot::Ready {
                            value,
                            ref_count: 0,
                        };
                        (AttemptOutcome::Created, None)
                    } else {
                        // close() raced with a completed creation; the fresh
                        // instance is disposed and never handed out.
                        (AttemptOutcome::Cancelled, Some(value))
                    }
                }
                Some(Err(error)) => {
                    if matches!(&*slot, Slot::Creating(_)) {
                        *slot = Slot::Empty;
                        (AttemptOutcome::Failed(Arc::new(error)), None)
                    } else {
                        // Cancellation takes precedence over the failure.
                        (AttemptOutcome::Cancelled, None)
                    }
                }
            }
        };

        if let Some(value) = orphan {
            dispose(value).await;
        }
        let _ = tx.send(Some(outcome));
    });
}

/// Shutdown (best-effort, logged on failure) followed by close.
async fn dispose<T: AutoShutdown>(value: Arc<T>) {
    if let Err(error) = value.shutdown().await {
        warn!("resource shutdown failed while closing: {error}");
    }
    value.close().await;
}

/// Releases the held value on drop by spawning the (shielded) release.
/// Used by [`RefCountedResource::with_resource`] so that cancellation of the
/// surrounding task cannot leak a reference.
struct ReleaseGuard<T: AutoShutdown> {
    resource: RefCountedResource<T>,
    value: Option<Arc<T>>,
}

impl<T: AutoShutdown> Drop for ReleaseGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let resource = self.resource.clone();
            tokio::spawn(async move {
                if let Err(error) = resource.release(&value).await {
                    if !error.is_cancelled() {
                        warn!("resource release during cleanup failed: {error}");
                    }
                }
            });
        }
    }
}
