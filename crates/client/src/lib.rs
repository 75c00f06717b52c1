//! # Tether Client Library
//!
//! Host-side client for the tether device-debugging protocol. This crate
//! composes the primitives from `tether-core` into a usable client:
//!
//! - **Transport**: how byte streams to the daemon are opened ([`transport`])
//! - **Shared link**: the lazily-created, reference-counted daemon
//!   connection shared by concurrent commands ([`link`])
//! - **Command execution**: the cancellable pipeline multiplexing a remote
//!   command's stdin, stdout, stderr and exit code over one channel
//!   ([`exec`])
//!
//! The typical entry point is [`TetherClient`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_client::{ClientConfig, TetherClient, transport::TcpTransport};
//!
//! # async fn demo() -> tether_core::Result<()> {
//! let transport = Arc::new(TcpTransport::new("127.0.0.1", 5037));
//! let client = TetherClient::new(transport, ClientConfig::default());
//!
//! let output = client.exec_collect("echo hello", None).await?;
//! assert_eq!(output.exit_code, 0);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod exec;
pub mod link;
pub mod service;
pub mod transport;

// Re-export commonly used types
pub use client::TetherClient;
pub use config::ClientConfig;
pub use exec::{ExecOutput, ExecStream, OutputChunk, SharedOutput};
pub use link::{DaemonLink, LinkLease, SharedLink};
