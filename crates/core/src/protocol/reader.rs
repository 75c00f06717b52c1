//! Frame decoder for the streaming shell sub-protocol

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::packet::{HEADER_LEN, MAX_PAYLOAD, Packet, PacketKind};

/// Decodes length-prefixed packets from an input stream.
///
/// Packets are read strictly in wire order. There is deliberately no overall
/// timeout: a remote command may run indefinitely, and the only way to end a
/// read loop early is to close the underlying connection.
pub struct FrameReader<R> {
    stream: R,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }

    /// Reads the next packet, byte-exact.
    ///
    /// A stream that ends mid-packet (or right before one) is reported as
    /// [`ProtocolError::UnexpectedEof`].
    pub async fn read_packet(&mut self) -> Result<Packet> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(map_eof)?;

        let kind = PacketKind::from_wire(header[0]);
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_PAYLOAD,
            }
            .into());
        }

        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(map_eof)?;

        Ok(Packet {
            kind,
            payload: Bytes::from(payload),
        })
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.stream
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader").finish()
    }
}

fn map_eof(error: std::io::Error) -> Error {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof.into()
    } else {
        error.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::writer::FrameWriter;

    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn frames_round_trip_byte_exact() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_packet(PacketKind::Stdout, b"hello")
            .await
            .unwrap();
        writer
            .write_packet(PacketKind::Stderr, b"oh no")
            .await
            .unwrap();
        writer
            .write_packet(PacketKind::ExitCode, &[0xFF])
            .await
            .unwrap();

        let stdout = reader.read_packet().await.unwrap();
        assert_eq!(stdout.kind, PacketKind::Stdout);
        assert_eq!(&stdout.payload[..], b"hello");

        let stderr = reader.read_packet().await.unwrap();
        assert_eq!(stderr.kind, PacketKind::Stderr);
        assert_eq!(&stderr.payload[..], b"oh no");

        let exit = reader.read_packet().await.unwrap();
        assert_eq!(exit.kind, PacketKind::ExitCode);
        assert_eq!(exit.exit_code().unwrap(), 255);
    }

    #[tokio::test]
    async fn prepared_payloads_patch_the_length_retroactively() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        // Stream the payload into the frame buffer, then commit: the header
        // was reserved up front and the length filled in afterwards.
        let buf = writer.prepare();
        buf.extend_from_slice(b"chunk one ");
        buf.extend_from_slice(b"chunk two");
        writer.commit(PacketKind::Stdin).await.unwrap();

        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.kind, PacketKind::Stdin);
        assert_eq!(&packet.payload[..], b"chunk one chunk two");
        assert_eq!(packet.payload.len(), 19);
    }

    #[tokio::test]
    async fn empty_payloads_are_valid_frames() {
        let (client, server) = duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_packet(PacketKind::CloseStdin, &[])
            .await
            .unwrap();
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.kind, PacketKind::CloseStdin);
        assert!(packet.payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_a_protocol_error() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        // Header claiming a 32 MiB payload.
        let mut header = vec![PacketKind::Stdout.to_wire()];
        header.extend_from_slice(&(32u32 * 1024 * 1024).to_le_bytes());
        client.write_all(&header).await.unwrap();

        let result = reader.read_packet().await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn truncated_frames_report_unexpected_eof() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);

        // A header promising 10 payload bytes, but only 3 arrive.
        let mut frame = vec![PacketKind::Stdout.to_wire()];
        frame.extend_from_slice(&10u32.to_le_bytes());
        frame.extend_from_slice(b"abc");
        client.write_all(&frame).await.unwrap();
        drop(client);

        let result = reader.read_packet().await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedEof))
        ));
    }

    #[tokio::test]
    async fn length_prefix_is_little_endian() {
        let (mut client, server) = duplex(4096);
        let mut reader = FrameReader::new(server);

        // 0x0102 bytes little-endian is [0x02, 0x01, 0x00, 0x00].
        let mut frame = vec![PacketKind::Stderr.to_wire(), 0x02, 0x01, 0x00, 0x00];
        frame.extend_from_slice(&vec![7u8; 0x0102]);
        client.write_all(&frame).await.unwrap();

        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.kind, PacketKind::Stderr);
        assert_eq!(packet.payload.len(), 0x0102);
    }
}
