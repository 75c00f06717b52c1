//! Binary framing of the streaming shell sub-protocol
//!
//! The sub-protocol multiplexes a remote command's stdin, stdout, stderr,
//! exit code and control signals over one byte-stream connection using
//! length-prefixed packets: `[1 byte kind][4 bytes little-endian u32 length]`
//! followed by the payload.

pub mod packet;
pub mod reader;
pub mod writer;

pub use packet::{HEADER_LEN, MAX_PAYLOAD, Packet, PacketKind};
pub use reader::FrameReader;
pub use writer::FrameWriter;
