//! Oracle subprocesses: feed a prompt on stdin, capture bounded output, enforce a deadline.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8192;
/// How long pipes may stay open after the child itself is gone.
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Bytes kept from one output stream plus how many were discarded past the cap.
#[derive(Debug, Default)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
    /// A descendant still held the pipe when we stopped reading; `bytes`
    /// holds what arrived until then.
    pub abandoned: bool,
}

impl StreamCapture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    fn push(&mut self, chunk: &[u8], cap: usize) {
        let keep = chunk.len().min(cap.saturating_sub(self.bytes.len()));
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }
}

/// A pipe drained on a background thread into a shared capture.
struct PipeReader {
    capture: Arc<Mutex<StreamCapture>>,
    done: Receiver<Result<()>>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R, cap: usize) -> Self {
        let capture = Arc::new(Mutex::new(StreamCapture::default()));
        let sink = Arc::clone(&capture);
        let done = background(move || {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let n = reader.read(&mut chunk).context("read child output")?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .map_err(|_| anyhow!("output capture poisoned"))?
                    .push(&chunk[..n], cap);
            }
        });
        Self { capture, done }
    }

    /// Everything read by `until`; marked abandoned if the pipe is still open.
    fn finish(self, until: Instant, what: &str) -> Result<StreamCapture> {
        let open = collect(&self.done, until, what)?.is_none();
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| anyhow!("{what} capture poisoned"))?;
        let mut taken = std::mem::take(&mut *capture);
        taken.abandoned = open;
        Ok(taken)
    }
}

/// Result of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Log-file rendering of both streams with truncation and timeout notes.
    pub fn transcript(&self) -> String {
        let mut buf = format!("exit: {:?}\n", self.status.code());
        for (name, stream) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            buf.push_str(&format!("--- {name} ---\n{}\n", stream.text()));
            if stream.dropped > 0 {
                buf.push_str(&format!("[{name}: {} bytes dropped]\n", stream.dropped));
            }
            if stream.abandoned {
                buf.push_str(&format!("[{name}: held open by a descendant, capture stopped]\n"));
            }
        }
        if self.timed_out {
            buf.push_str("[killed after timeout]\n");
        }
        buf
    }
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// stdin, stdout and stderr are serviced on their own threads so a child that
/// writes before it finishes reading cannot stall us. Each output stream keeps
/// at most `output_cap` bytes and is drained until EOF, the deadline, or a
/// short grace after the child exits, whichever is last. Pipes inherited by
/// descendants that outlive the child are abandoned at that point, so the
/// call returns within `timeout` plus the grace.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_cap))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_cap: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout_reader = PipeReader::spawn(stdout, output_cap);
    let stderr_reader = PipeReader::spawn(stderr, output_cap);
    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(feed_stdin(pipe, input.to_vec())),
        _ => None,
    };

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;

    // Wait for the pipes until the deadline, and at least a short grace.
    let pipes_until = deadline.max(Instant::now() + PIPE_GRACE);
    if let Some(feeder) = feeder
        && collect(&feeder, pipes_until, "stdin writer")?.is_none()
    {
        debug!("stdin still blocked after exit, abandoning writer");
    }
    let stdout = stdout_reader.finish(pipes_until, "stdout reader")?;
    let stderr = stderr_reader.finish(pipes_until, "stderr reader")?;
    if stdout.abandoned || stderr.abandoned {
        warn!("child output pipes held open by a descendant, output abandoned");
    }
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output exceeded cap"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Run `work` on a detached thread and hand back a channel for its result.
fn background<T, F>(work: F) -> Receiver<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // Nobody listens once the result was abandoned.
        let _ = tx.send(work());
    });
    rx
}

/// Result of a background thread, or `None` if it is still busy at `until`.
fn collect<T>(rx: &Receiver<Result<T>>, until: Instant, what: &str) -> Result<Option<T>> {
    match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{what} thread panicked")),
    }
}

fn feed_stdin(mut pipe: impl Write + Send + 'static, input: Vec<u8>) -> Receiver<Result<()>> {
    background(move || match pipe.write_all(&input) {
        // The child may exit without consuming its input.
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        other => other.context("write child stdin"),
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "child exceeded deadline, killing");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}
