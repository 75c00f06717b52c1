//! The service request handshake that precedes a streamed command
//!
//! A service request is the single request/response exchange the pipeline
//! needs: the client sends a 4-digit-hex length prefix followed by the
//! service string, and the daemon answers `OKAY` (the stream now speaks the
//! requested sub-protocol) or `FAIL` with a length-prefixed reason.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tether_core::error::{Error, ProtocolError, Result};

/// Largest service string the 4-hex-digit length prefix can carry.
const MAX_SERVICE_LEN: usize = 0xFFFF;

/// Sends `service` and waits for the daemon's status reply.
pub async fn send_service_request<S>(stream: &mut S, service: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let payload = service.as_bytes();
    if payload.len() > MAX_SERVICE_LEN {
        return Err(ProtocolError::ServiceTooLong {
            len: payload.len(),
        }
        .into());
    }

    debug!("sending service request: {service}");
    stream
        .write_all(format!("{:04x}", payload.len()).as_bytes())
        .await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await.map_err(map_eof)?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let reason = read_hex_prefixed(stream).await?;
            Err(ProtocolError::ServiceRejected { reason }.into())
        }
        other => Err(ProtocolError::BadStatus {
            status: String::from_utf8_lossy(other).into_owned(),
        }
        .into()),
    }
}

/// Reads a 4-digit-hex length prefix and the UTF-8 string it announces.
async fn read_hex_prefixed<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin + Send,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.map_err(map_eof)?;
    let text = std::str::from_utf8(&prefix).map_err(|_| ProtocolError::BadStatus {
        status: String::from_utf8_lossy(&prefix).into_owned(),
    })?;
    let len = usize::from_str_radix(text, 16).map_err(|_| ProtocolError::BadStatus {
        status: text.to_string(),
    })?;

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await.map_err(map_eof)?;
    Ok(String::from_utf8_lossy(&message).into_owned())
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

    use tokio::io::duplex;

    #[tokio::test]
    async fn accepted_requests_return_ok() {
        let (mut client, mut server) = duplex(1024);

        let daemon = tokio::spawn(async move {
            let mut prefix = [0u8; 4];
            server.read_exact(&mut prefix).await.unwrap();
            let len = usize::from_str_radix(std::str::from_utf8(&prefix).unwrap(), 16).unwrap();
            let mut service = vec![0u8; len];
            server.read_exact(&mut service).await.unwrap();
            assert_eq!(&service, b"shell,v2,raw:ls");
            server.write_all(b"OKAY").await.unwrap();
        });

        send_service_request(&mut client, "shell,v2,raw:ls")
            .await
            .unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_requests_carry_the_daemon_reason() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut skip = [0u8; 4 + 9];
            server.read_exact(&mut skip).await.unwrap();
            server.write_all(b"FAIL0006no ls!").await.unwrap();
        });

        let result = send_service_request(&mut client, "bad:items").await;
        match result {
            Err(Error::Protocol(ProtocolError::ServiceRejected { reason })) => {
                assert_eq!(reason, "no ls!");
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_status_is_a_protocol_error() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut skip = [0u8; 4 + 4];
            server.read_exact(&mut skip).await.unwrap();
            server.write_all(b"WHAT").await.unwrap();
        });

        let result = send_service_request(&mut client, "ping").await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::BadStatus { .. }))
        ));
    }
}
