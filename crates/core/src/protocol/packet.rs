//! Packet model of the streaming shell sub-protocol
//!
//! Each packet on the wire is `[1 byte kind][4 bytes little-endian length]`
//! followed by exactly that many payload bytes.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Bytes of header preceding every payload: kind tag plus length prefix.
pub const HEADER_LEN: usize = 5;

/// Sanity cap on a single frame's payload.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Packet kind tags as they appear on the wire.
///
/// `Stdin`, `CloseStdin` and `WindowSizeChange` travel client→daemon;
/// `Stdout`, `Stderr` and `ExitCode` travel daemon→client. Unknown tags
/// decode to `Invalid` so a read loop can skip them instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    ExitCode = 3,
    CloseStdin = 4,
    WindowSizeChange = 5,
    Invalid = 255,
}

impl PacketKind {
    pub fn from_wire(tag: u8) -> Self {
        match tag {
            0 => PacketKind::Stdin,
            1 => PacketKind::Stdout,
            2 => PacketKind::Stderr,
            3 => PacketKind::ExitCode,
            4 => PacketKind::CloseStdin,
            5 => PacketKind::WindowSizeChange,
            _ => PacketKind::Invalid,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// True for the kinds a client expects on the output side of a command.
    pub fn is_daemon_to_client(self) -> bool {
        matches!(
            self,
            PacketKind::Stdout | PacketKind::Stderr | PacketKind::ExitCode
        )
    }
}

/// One decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Bytes,
}

impl Packet {
    /// Interprets the payload as a command exit code.
    ///
    /// The payload must be exactly one byte, read unsigned: `0xFF` is 255,
    /// never -1.
    pub fn exit_code(&self) -> Result<u8> {
        if self.payload.len() != 1 {
            return Err(ProtocolError::BadExitCode {
                len: self.payload.len(),
            }
            .into());
        }
        Ok(self.payload[0])
    }
}
