//! Shared test harness: an in-memory transport and a scriptable fake daemon
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::JoinHandle;

use tether_core::error::{Error, Result};
use tether_core::protocol::{FrameWriter, PacketKind};
use tether_client::transport::{Transport, TransportStream};

/// Hands out pre-arranged in-memory streams, one per `connect` call.
///
/// The first connect is the client's control stream; later ones are the
/// per-command channels, in order.
pub struct TestTransport {
    streams: Mutex<VecDeque<DuplexStream>>,
    connects: AtomicUsize,
}

impl TestTransport {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn connect(&self) -> Result<Box<dyn TransportStream>> {
        let stream = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::internal("test transport ran out of streams"))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    fn description(&self) -> String {
        "test://daemon".to_string()
    }
}

/// Builds a transport that will serve `stream_count` connects, returning the
/// daemon-side halves in connect order.
pub fn test_transport(stream_count: usize) -> (std::sync::Arc<TestTransport>, Vec<DuplexStream>) {
    let mut clients = VecDeque::new();
    let mut servers = Vec::new();
    for _ in 0..stream_count {
        let (client, server) = duplex(64 * 1024);
        clients.push_back(client);
        servers.push(server);
    }
    let transport = std::sync::Arc::new(TestTransport {
        streams: Mutex::new(clients),
        connects: AtomicUsize::new(0),
    });
    (transport, servers)
}

/// Reads a 4-digit-hex length-prefixed service request from the client.
pub async fn read_service_request<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let len = usize::from_str_radix(std::str::from_utf8(&prefix).unwrap(), 16).unwrap();
    let mut service = vec![0u8; len];
    stream.read_exact(&mut service).await.unwrap();
    String::from_utf8(service).unwrap()
}

/// Accepts whatever service the client asks for and returns it.
pub async fn accept_service(stream: &mut DuplexStream) -> String {
    let service = read_service_request(stream).await;
    stream.write_all(b"OKAY").await.unwrap();
    service
}

/// Rejects the client's service request with `reason`.
pub async fn reject_service(stream: &mut DuplexStream, reason: &str) {
    let _ = read_service_request(stream).await;
    stream.write_all(b"FAIL").await.unwrap();
    stream
        .write_all(format!("{:04x}", reason.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(reason.as_bytes()).await.unwrap();
}

/// Writes one shell protocol packet to the client.
pub async fn write_packet(stream: &mut DuplexStream, kind: PacketKind, payload: &[u8]) {
    let mut writer = FrameWriter::new(stream);
    writer.write_packet(kind, payload).await.unwrap();
}

/// Spawns a task that resolves once the stream reaches EOF, i.e. once the
/// client has half-closed or dropped its side.
pub fn watch_for_eof(mut stream: DuplexStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
}
