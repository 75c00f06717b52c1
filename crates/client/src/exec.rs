//! The command execution pipeline
//!
//! Running a remote command composes the rest of the stack: a lease on the
//! shared daemon link, a per-command transport channel carrying the service
//! request, a stdin forwarder framing input packets, and an output collector
//! parsing stdout/stderr/exit packets into typed chunks.
//!
//! The two activities run concurrently and the output is exposed as a lazy,
//! cancellable sequence. A one-slot handoff between the read loop and the
//! consumer means a collector that briefly stops consuming does not stall
//! stdin forwarding. However the pipeline ends (completion, failure,
//! cancellation, or the consumer simply dropping the stream), the link lease
//! is released exactly once.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::error::{Error, ProtocolError, Result};
use tether_core::io::RewindableSource;
use tether_core::protocol::{FrameReader, FrameWriter, HEADER_LEN, PacketKind};
use tether_core::sync::BroadcastBus;

use crate::link::LinkLease;
use crate::service::send_service_request;

/// Typed chunk of remote command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
    /// Terminal chunk; no further output follows it.
    Exit(u8),
}

/// Everything a finished command produced, collected in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u8,
}

/// Pipeline lifecycle, tracked for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    RequestSent,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

fn transition(state: &mut PipelineState, to: PipelineState) {
    let from = *state;
    debug!(?from, ?to, "exec pipeline state change");
    *state = to;
}

/// A lazily-produced, cancellable sequence of command output chunks.
///
/// Dropping the stream cancels the pipeline; the underlying link lease is
/// released either way.
pub struct ExecStream {
    rx: mpsc::Receiver<Result<OutputChunk>>,
    cancel: CancellationToken,
    finished: bool,
}

impl ExecStream {
    /// Returns the next output chunk.
    ///
    /// Yields `None` after the terminal [`OutputChunk::Exit`] chunk or a
    /// failure has been delivered.
    pub async fn next(&mut self) -> Option<Result<OutputChunk>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(OutputChunk::Exit(code))) => {
                self.finished = true;
                Some(Ok(OutputChunk::Exit(code)))
            }
            Some(Err(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            Some(chunk) => Some(chunk),
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Cancels the pipeline: both the stdin forwarder and the output
    /// collector stop, and the link lease is released.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into an in-memory [`ExecOutput`].
    pub async fn collect(mut self) -> Result<ExecOutput> {
        let mut output = ExecOutput::default();
        while let Some(chunk) = self.next().await {
            match chunk? {
                OutputChunk::Stdout(data) => output.stdout.extend_from_slice(&data),
                OutputChunk::Stderr(data) => output.stderr.extend_from_slice(&data),
                OutputChunk::Exit(code) => {
                    output.exit_code = code;
                    return Ok(output);
                }
            }
        }
        // The stream ended without an exit code.
        Err(ProtocolError::UnexpectedEof.into())
    }

    /// Turns this stream into a serialized broadcast so several consumers can
    /// observe the same command, late joiners catching up from a bounded
    /// replay of the most recent chunks.
    ///
    /// Chunks produced while nobody is subscribed only survive in the replay
    /// buffer; the pump itself never blocks on absent subscribers.
    pub fn into_shared(mut self, replay_capacity: usize) -> SharedOutput {
        let bus = BroadcastBus::with_replay(replay_capacity);
        let pump = {
            let bus = bus.clone();
            tokio::spawn(async move {
                while let Some(chunk) = self.next().await {
                    match chunk {
                        Ok(chunk) => {
                            let done = matches!(chunk, OutputChunk::Exit(_));
                            if bus.emit(chunk).await.is_err() || done {
                                break;
                            }
                        }
                        Err(error) => {
                            warn!("shared command output ended with a failure: {error}");
                            break;
                        }
                    }
                }
                bus.close();
            })
        };
        SharedOutput { bus, _pump: pump }
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("finished", &self.finished)
            .finish()
    }
}

/// Broadcast view of one command's output.
#[derive(Debug)]
pub struct SharedOutput {
    bus: BroadcastBus<OutputChunk>,
    _pump: JoinHandle<()>,
}

impl SharedOutput {
    /// Subscribes to the command output; replayed chunks come first.
    pub fn subscribe(&self) -> tether_core::sync::Subscription<OutputChunk> {
        self.bus.subscribe()
    }

    /// Ends the broadcast, cancelling every subscription.
    pub fn close(&self) {
        self.bus.close();
    }
}

/// Runs a command: opens a channel on the leased link, sends the service
/// request, and starts the streaming phase. Takes ownership of the lease;
/// it is released exactly once when the pipeline ends, no matter how it
/// ends, including a request that never gets accepted.
pub(crate) async fn start(
    lease: LinkLease,
    service: &str,
    stdin: Option<Box<dyn RewindableSource>>,
    buffer_size: usize,
) -> Result<ExecStream> {
    let mut state = PipelineState::Idle;

    let open = async {
        let mut channel = lease.link().open_channel().await?;
        send_service_request(&mut channel, service).await?;
        Ok(channel)
    };
    let channel = match open.await {
        Ok(channel) => channel,
        Err(error) => {
            // The pipeline never started; give the lease back before
            // surfacing the failure. A teardown error must not mask the
            // original one.
            if let Err(release_error) = lease.release().await {
                debug!("lease release after a failed request: {release_error}");
            }
            return Err(error);
        }
    };
    transition(&mut state, PipelineState::RequestSent);

    // One slot of lookahead decouples the read loop from the consumer.
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        run_pipeline(channel, stdin, lease, buffer_size, tx, task_cancel, state).await;
    });

    Ok(ExecStream {
        rx,
        cancel,
        finished: false,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline<C>(
    channel: C,
    stdin: Option<Box<dyn RewindableSource>>,
    lease: LinkLease,
    buffer_size: usize,
    tx: mpsc::Sender<Result<OutputChunk>>,
    cancel: CancellationToken,
    mut state: PipelineState,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    transition(&mut state, PipelineState::Streaming);
    let (read_half, write_half) = tokio::io::split(channel);

    let forward_cancel = cancel.child_token();
    let mut forwarder = stdin.map(|source| {
        let forward_cancel = forward_cancel.clone();
        tokio::spawn(
            async move { forward_stdin(write_half, source, buffer_size, forward_cancel).await },
        )
    });

    let output_fut = collect_output(read_half, &tx);
    tokio::pin!(output_fut);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Err(Error::Cancelled),
            result = &mut output_fut => break result,
            result = await_forwarder(&mut forwarder) => {
                forwarder = None;
                match result {
                    // Stdin fully forwarded; keep collecting output.
                    Ok(()) => {}
                    Err(error) if error.is_cancelled() => {}
                    // A failing forwarder fails the whole pipeline.
                    Err(error) => break Err(error),
                }
            }
        }
    };

    // Stop whichever activity is still running.
    forward_cancel.cancel();
    if let Some(task) = forwarder {
        let _ = task.await;
    }

    match outcome {
        Ok(()) => transition(&mut state, PipelineState::Completed),
        Err(ref error) if error.is_cancelled() => transition(&mut state, PipelineState::Cancelled),
        Err(_) => transition(&mut state, PipelineState::Failed),
    }
    if let Err(error) = outcome {
        if !error.is_cancelled() {
            // The consumer may already be gone; that loses nothing.
            let _ = tx.send(Err(error)).await;
        }
    }

    // The one release for this pipeline; shielded inside the resource.
    if let Err(error) = lease.release().await {
        if !error.is_cancelled() {
            warn!("releasing the daemon link after a command failed: {error}");
        }
    }
}

/// Collects daemon→client packets into typed chunks until the exit code.
///
/// Client→daemon and unknown packet kinds showing up here are logged and
/// skipped; only the exit code ends the loop.
async fn collect_output<R>(read_half: R, tx: &mpsc::Sender<Result<OutputChunk>>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = FrameReader::new(read_half);
    loop {
        let packet = reader.read_packet().await?;
        match packet.kind {
            PacketKind::Stdout => {
                if tx
                    .send(Ok(OutputChunk::Stdout(packet.payload)))
                    .await
                    .is_err()
                {
                    return Err(Error::Cancelled);
                }
            }
            PacketKind::Stderr => {
                if tx
                    .send(Ok(OutputChunk::Stderr(packet.payload)))
                    .await
                    .is_err()
                {
                    return Err(Error::Cancelled);
                }
            }
            PacketKind::ExitCode => {
                let code = packet.exit_code()?;
                debug!(code, "command exited");
                let _ = tx.send(Ok(OutputChunk::Exit(code))).await;
                return Ok(());
            }
            kind => {
                warn!(?kind, "skipping unexpected shell packet");
            }
        }
    }
}

/// Frames stdin chunks onto the channel, ending with a close-stdin packet at
/// EOF. Each chunk is read directly into the reserved frame buffer so the
/// bytes are never copied through a temporary.
async fn forward_stdin<W>(
    write_half: W,
    mut source: Box<dyn RewindableSource>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut writer = FrameWriter::new(write_half);
    loop {
        let count = {
            let buf = writer.prepare();
            buf.resize(HEADER_LEN + buffer_size, 0);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = source.read(&mut buf[HEADER_LEN..]) => result?,
            }
        };
        writer.prepared_mut().truncate(HEADER_LEN + count);

        let kind = if count == 0 {
            PacketKind::CloseStdin
        } else {
            PacketKind::Stdin
        };
        // The write is cancellable too: a daemon that stops draining stdin
        // must not wedge pipeline teardown. A torn frame is fine, the
        // channel is abandoned wholesale on cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = writer.commit(kind) => result?,
        }

        if count == 0 {
            debug!("stdin reached EOF, close-stdin sent");
            return Ok(());
        }
    }
}

/// Resolves when the forwarder task finishes; pends forever once it is gone
/// so the surrounding select can keep driving the output future.
async fn await_forwarder(forwarder: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match forwarder.as_mut() {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::internal(format!(
                "stdin forwarder task failed: {join_error}"
            ))),
        },
        None => std::future::pending().await,
    }
}
