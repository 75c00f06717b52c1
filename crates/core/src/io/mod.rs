//! Byte source abstractions

pub mod rewindable;

pub use rewindable::{BufferSource, RecordingSource, RewindableSource, read_remaining};
