//! Synchronization primitives for independently scheduled tasks
//!
//! Three building blocks with one shared rule: every wait is a genuine
//! suspension released by a matching operation or by cancellation, never a
//! busy-wait.

pub mod broadcast;
pub mod ref_counted;
pub mod rendezvous;

pub use broadcast::{BroadcastBus, Subscription};
pub use ref_counted::{AutoShutdown, RefCountedResource};
pub use rendezvous::RendezvousChannel;
