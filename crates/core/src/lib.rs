//! # Tether Core Library
//!
//! Concurrency and wire-protocol core shared by the tether client crates.
//! It provides the primitives a host-side client of the tether
//! device-debugging protocol is built from:
//!
//! - **Reference-counted resources**: lazy, at-most-once construction of an
//!   expensive shared value with asynchronous, cancellation-shielded teardown
//! - **Rendezvous channel**: single-slot blocking handoff with a completion
//!   guarantee for the sender
//! - **Serialized broadcast**: one-to-many delivery where an emission
//!   completes only once every subscriber has processed it, with bounded
//!   replay for late subscribers
//! - **Rewindable byte sources**: consume-once streams that can be rewound
//!   or snapshotted into disconnected offline copies
//! - **Protocol framing**: the length-prefixed packet format multiplexing a
//!   remote command's stdio and exit code over one connection
//!
//! Every blocking operation in this crate is cancellable, and no operation
//! ever resolves to anything but a value, a typed error, or cancellation.

pub mod error;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod sync;

// Re-export commonly used types
pub use error::{Error, ProtocolError, ResourceError, Result};
pub use io::{BufferSource, RecordingSource, RewindableSource, read_remaining};
pub use logging::{LogFormat, LogLevel, LoggingConfig, init_logging};
pub use protocol::{FrameReader, FrameWriter, Packet, PacketKind};
pub use sync::{AutoShutdown, BroadcastBus, RefCountedResource, RendezvousChannel, Subscription};
