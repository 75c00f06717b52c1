//! Unified error handling for the tether crates
//!
//! Every fallible operation in the workspace resolves to exactly one of a
//! successful value, a typed failure, or [`Error::Cancelled`]. Cancellation
//! always takes precedence: an operation abandoned while a failure is in
//! flight reports `Cancelled`, never the failure.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for all tether operations
pub type Result<T> = std::result::Result<T, Error>;

/// Central error type for all tether operations
#[derive(Error, Debug)]
pub enum Error {
    /// The operation was abandoned by its caller, or by a `close()`/`cancel()`
    /// on the primitive it was blocked on.
    #[error("operation cancelled")]
    Cancelled,

    /// Reference-counted resource lifecycle errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Wire protocol errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Operation invoked on a primitive in a state that cannot serve it,
    /// e.g. `rewind()` after `close()`, or a release without a matching retain.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// I/O errors from the underlying transport
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Reference-counted resource lifecycle errors
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The creation function failed. Every `retain()` call awaiting the same
    /// creation attempt observes this error; it is never cached across
    /// attempts, so the next `retain()` re-invokes the creation function.
    #[error("resource creation failed: {0}")]
    CreationFailed(#[source] Arc<Error>),

    /// The best-effort shutdown step of teardown failed. The instance was
    /// still disposed; only the `release()` call that triggered the teardown
    /// observes this error.
    #[error("resource shutdown failed: {0}")]
    ShutdownFailed(#[source] Box<Error>),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame length prefix above the sanity cap
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u32, max: u32 },

    /// An exit-code packet must carry exactly one payload byte
    #[error("exit code packet has a {len} byte payload, expected exactly 1")]
    BadExitCode { len: usize },

    /// The daemon rejected the service request
    #[error("service request rejected by daemon: {reason}")]
    ServiceRejected { reason: String },

    /// The daemon answered a service request with neither OKAY nor FAIL
    #[error("invalid service request status: {status:?}")]
    BadStatus { status: String },

    /// A service string too long for the length-prefixed request format
    #[error("service string of {len} bytes exceeds the request format limit")]
    ServiceTooLong { len: usize },

    /// The connection closed in the middle of a packet, or before the
    /// exit code was observed
    #[error("connection closed unexpectedly")]
    UnexpectedEof,
}

impl Error {
    /// True when the error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn illegal_state<S: Into<String>>(reason: S) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
