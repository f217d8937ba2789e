//! Bridges a git subprocess onto an SSH channel.
//!
//! A [`ProcessLink`] owns the child and its three pipes.  Client data flows
//! into the child's stdin on a dedicated task, stdout is streamed to the
//! channel as it arrives, and stderr is delivered on the extended-data
//! stream once stdout is drained.  Stderr is buffered concurrently (up to
//! [`STDERR_LIMIT`]) so a chatty child cannot stall on a full stderr pipe
//! while stdout is still being relayed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::ProcessError;

/// SSH extended-data type code for stderr (RFC 4254 §5.2).
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Client data chunks that may wait for the child's stdin.  A full queue
/// makes the connection stop reading, which pushes back on the client.
pub const STDIN_QUEUE: usize = 16;

/// Stderr kept for delivery after stdout.  Anything beyond is read and
/// discarded so the child never blocks on the pipe.
pub const STDERR_LIMIT: usize = 1024 * 1024;

/// Sending half of the stdin queue, held by the channel.
pub type ClientFeed = mpsc::Sender<Vec<u8>>;

/// Chunks of client data headed for the child's stdin.
pub type ClientInput = mpsc::Receiver<Vec<u8>>;

pub fn client_channel() -> (ClientFeed, ClientInput) {
    mpsc::channel(STDIN_QUEUE)
}

// ---------------------------------------------------------------------------
// Channel sink
// ---------------------------------------------------------------------------

/// The channel side of the bridge.
#[async_trait]
pub trait ChannelSink: Send {
    async fn data(&mut self, bytes: &[u8]) -> Result<(), ProcessError>;
    async fn extended_data(&mut self, bytes: &[u8]) -> Result<(), ProcessError>;
    /// Send the completion signal and close the channel.
    async fn finish(&mut self, exit_status: u32) -> Result<(), ProcessError>;
}

/// A session channel reached through the connection's [`Handle`].
pub struct ChannelHandle {
    handle: Handle,
    id: ChannelId,
}

impl ChannelHandle {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ChannelSink for ChannelHandle {
    async fn data(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        self.handle
            .data(self.id, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| ProcessError::Relay("stdout"))
    }

    async fn extended_data(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        self.handle
            .extended_data(self.id, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| ProcessError::Relay("stderr"))
    }

    /// RFC 4254: exit-status → EOF → close.
    async fn finish(&mut self, exit_status: u32) -> Result<(), ProcessError> {
        let sent = self.handle.exit_status_request(self.id, exit_status).await;
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
        sent.map_err(|_| ProcessError::Relay("exit-status"))
    }
}

// ---------------------------------------------------------------------------
// Process link
// ---------------------------------------------------------------------------

/// Everything needed to start the subprocess for one `exec` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the server's own environment.
    pub env: Vec<(String, String)>,
}

/// A started subprocess with all three standard streams captured.
pub struct ProcessLink {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    program: String,
}

impl std::fmt::Debug for ProcessLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLink")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ProcessLink {
    /// Start the subprocess.  Nothing has been acknowledged to the client
    /// yet, so a failure here leaves the request unanswered.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

        debug!(program = %spec.program, args = ?spec.args, pid = ?child.id(), "subprocess started");
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            program: spec.program.clone(),
        })
    }

    /// Relay the child's streams until it exits, then send the completion
    /// signal.
    ///
    /// The completion signal carries the child's exit code when
    /// `propagate_exit_status` is set and 0 otherwise.  Returns the child's
    /// exit code; an unsuccessful exit is reported as an error after the
    /// completion signal has gone out.
    pub async fn run<S: ChannelSink>(
        self,
        input: ClientInput,
        sink: &mut S,
        propagate_exit_status: bool,
    ) -> Result<u32, ProcessError> {
        let Self {
            mut child,
            stdin,
            mut stdout,
            stderr,
            program,
        } = self;

        // Not awaited: client input must never hold back output delivery.
        tokio::spawn(copy_input(input, stdin));

        let stderr_task = tokio::spawn(drain_stderr(stderr, STDERR_LIMIT));

        let mut relay = Ok(());
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.data(&buf[..n]).await {
                        relay = Err(e);
                        break;
                    }
                }
                Err(e) => {
                    debug!(%program, error = %e, "error reading child stdout");
                    break;
                }
            }
        }
        // Closing our end lets a child still writing to stdout fail fast
        // instead of blocking forever.
        drop(stdout);

        let stderr_bytes = match stderr_task.await {
            Ok(Ok((bytes, 0))) => bytes,
            Ok(Ok((bytes, dropped))) => {
                warn!(%program, kept = bytes.len(), dropped, "child stderr truncated");
                bytes
            }
            Ok(Err(e)) => {
                debug!(%program, error = %e, "error reading child stderr");
                Vec::new()
            }
            Err(e) => {
                warn!(%program, error = %e, "stderr reader task failed");
                Vec::new()
            }
        };
        if relay.is_ok() && !stderr_bytes.is_empty() {
            relay = sink.extended_data(&stderr_bytes).await;
        }

        let outcome = child.wait().await;
        let code = match outcome {
            Ok(ref status) => exit_code(status),
            Err(_) => 1,
        };
        let reported = if propagate_exit_status { code } else { 0 };
        let finished = sink.finish(reported).await;

        relay?;
        finished?;
        match outcome {
            Ok(status) if status.success() => Ok(code),
            Ok(status) => Err(ProcessError::Exit(status)),
            Err(e) => Err(ProcessError::Wait(e)),
        }
    }
}

/// Exit code of a terminated child; signal termination maps to 1.
fn exit_code(status: &ExitStatus) -> u32 {
    status.code().map(|c| c as u32).unwrap_or(1)
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// Counts running bridges so shutdown can wait for them to finish.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by a bridge task for as long as its subprocess is being relayed.
#[derive(Debug)]
pub struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once no bridge is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Read stderr to EOF, keeping the first `limit` bytes.  Returns the kept
/// bytes and the number discarded.
async fn drain_stderr(mut stderr: ChildStderr, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = stderr.read(&mut buf).await?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let take = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&buf[..take]);
        dropped += n - take;
    }
}

/// Copy client data into the child's stdin until the client sends EOF
/// (the sender is dropped) or the child stops reading.
async fn copy_input(mut input: ClientInput, mut stdin: ChildStdin) {
    while let Some(chunk) = input.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!(error = %e, "failed to write client data to subprocess stdin");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "failed to close subprocess stdin");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Stdout(Vec<u8>),
        Stderr(Vec<u8>),
        Exit(u32),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    #[async_trait]
    impl ChannelSink for Recorder {
        async fn data(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
            // Coalesce chunked reads so assertions see whole streams.
            if let Some(Event::Stdout(prev)) = self.events.last_mut() {
                prev.extend_from_slice(bytes);
            } else {
                self.events.push(Event::Stdout(bytes.to_vec()));
            }
            Ok(())
        }

        async fn extended_data(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
            self.events.push(Event::Stderr(bytes.to_vec()));
            Ok(())
        }

        async fn finish(&mut self, exit_status: u32) -> Result<(), ProcessError> {
            self.events.push(Event::Exit(exit_status));
            Ok(())
        }
    }

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        }
    }

    fn input(chunks: &[&[u8]]) -> ClientInput {
        let (tx, rx) = client_channel();
        for chunk in chunks {
            tx.try_send(chunk.to_vec()).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn echoes_stdin_then_stderr_then_one_exit() {
        let link = ProcessLink::spawn(&sh("cat; echo oops >&2")).unwrap();
        let mut sink = Recorder::default();

        let code = link
            .run(input(&[b"hello ", b"world\n"]), &mut sink, true)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            sink.events,
            vec![
                Event::Stdout(b"hello world\n".to_vec()),
                Event::Stderr(b"oops\n".to_vec()),
                Event::Exit(0),
            ]
        );
    }

    #[tokio::test]
    async fn large_stderr_does_not_block_stdout() {
        // 256 KiB of stderr is well past a pipe buffer; it is written before
        // any stdout.
        let script = "head -c 262144 /dev/zero >&2; echo done";
        let link = ProcessLink::spawn(&sh(script)).unwrap();
        let mut sink = Recorder::default();

        link.run(input(&[]), &mut sink, true).await.unwrap();

        assert_eq!(sink.events[0], Event::Stdout(b"done\n".to_vec()));
        match &sink.events[1] {
            Event::Stderr(bytes) => assert_eq!(bytes.len(), 262_144),
            other => panic!("expected stderr, got {other:?}"),
        }
        assert_eq!(sink.events[2], Event::Exit(0));
    }

    #[tokio::test]
    async fn stderr_beyond_limit_is_discarded() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "head -c 5000 /dev/zero >&2"])
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();

        let (kept, dropped) = drain_stderr(stderr, 1000).await.unwrap();
        child.wait().await.unwrap();

        assert_eq!(kept.len(), 1000);
        assert_eq!(dropped, 4000);
    }

    #[tokio::test]
    async fn full_stdin_queue_blocks_the_sender() {
        let (tx, _rx) = client_channel();
        for _ in 0..STDIN_QUEUE {
            tx.send(vec![0; 1024]).await.unwrap();
        }
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tx.send(vec![0; 1024]),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn exit_status_is_propagated() {
        let link = ProcessLink::spawn(&sh("exit 3")).unwrap();
        let mut sink = Recorder::default();

        let err = link.run(input(&[]), &mut sink, true).await.unwrap_err();

        assert!(matches!(err, ProcessError::Exit(status) if status.code() == Some(3)));
        assert_eq!(sink.events, vec![Event::Exit(3)]);
    }

    #[tokio::test]
    async fn fixed_zero_status_when_not_propagating() {
        let link = ProcessLink::spawn(&sh("exit 3")).unwrap();
        let mut sink = Recorder::default();

        assert!(link.run(input(&[]), &mut sink, false).await.is_err());
        assert_eq!(sink.events, vec![Event::Exit(0)]);
    }

    #[tokio::test]
    async fn environment_and_working_directory_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = sh("printf '%s %s' \"$GITGATE_KEY\" \"$(basename \"$(pwd -P)\")\"");
        spec.cwd = tmp.path().to_path_buf();
        spec.env.push(("GITGATE_KEY".into(), "key-1".into()));
        let dir_name = tmp.path().file_name().unwrap().to_string_lossy().into_owned();

        let link = ProcessLink::spawn(&spec).unwrap();
        let mut sink = Recorder::default();
        link.run(input(&[]), &mut sink, true).await.unwrap();

        assert_eq!(
            sink.events[0],
            Event::Stdout(format!("key-1 {dir_name}").into_bytes())
        );
    }

    #[tokio::test]
    async fn wait_idle_resolves_when_last_guard_drops() {
        let inflight = Arc::new(InFlight::default());
        inflight.wait_idle().await;

        let first = inflight.enter();
        let second = inflight.enter();
        assert_eq!(inflight.count(), 2);

        let waiter = tokio::spawn({
            let inflight = Arc::clone(&inflight);
            async move { inflight.wait_idle().await }
        });
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
        assert_eq!(inflight.count(), 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spec = SpawnSpec {
            program: "/nonexistent/git".into(),
            args: vec!["upload-pack".into(), "repo".into()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        assert!(matches!(
            ProcessLink::spawn(&spec),
            Err(ProcessError::Spawn { .. })
        ));
    }
}
