use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sandbox::{ExecResult, ProcessExit, Result, SandboxError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for output pipes to close once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest progress line forwarded; the rest of the line is cut.
const MAX_PROGRESS_LINE: usize = 4096;

/// Kill the entire process group led by `pid` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. Returns `false` if the signal could not be delivered
/// (including when the group is already gone).
pub(crate) fn kill_process_group(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let pgid = nix::unistd::Pid::from_raw(pid);
    nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL).is_ok()
}

/// PID of the process group currently running inside a sandbox, if any.
#[derive(Default)]
pub(crate) struct RunningGroup(Mutex<Option<u32>>);

impl RunningGroup {
    fn set(&self, pid: Option<u32>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    pub(crate) fn get(&self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output buffer that keeps the first `cap` bytes and counts the rest.
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let (kept, rest) = chunk.split_at(room.min(chunk.len()));
        self.data.extend_from_slice(kept);
        self.dropped += rest.len();
    }
}

type SharedBuffer = Arc<Mutex<CappedBuffer>>;

pub(crate) struct RunOptions {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_stream_bytes: usize,
}

/// Spawn `command` in its own process group, capture its output, and enforce
/// the timeout. Captured output is returned even when the process timed out.
pub(crate) async fn run_captured(
    mut command: Command,
    options: &RunOptions,
    running: &RunningGroup,
    progress: Option<mpsc::Sender<String>>,
) -> Result<ExecResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::ExecFailed(format!("spawn interpreter: {e}")))?;
    let pid = child.id();
    running.set(pid);

    let stdout_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(options.max_stream_bytes)));
    let stderr_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(options.max_stream_bytes)));
    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain(stdout, Arc::clone(&stdout_buf), progress.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain(stderr, Arc::clone(&stderr_buf), progress)));
    }

    let exit = match tokio::time::timeout(options.timeout, child.wait()).await {
        Ok(Ok(status)) => match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Exited(code),
            (None, Some(signal)) => ProcessExit::Signaled(signal),
            (None, None) => ProcessExit::Exited(-1),
        },
        Ok(Err(e)) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            running.set(None);
            abort_all(drains);
            return Err(SandboxError::ExecFailed(format!("wait for interpreter: {e}")));
        }
        Err(_) => {
            debug!(pid = ?pid, "execution timed out, killing process group");
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let reaped = matches!(
                tokio::time::timeout(options.kill_grace, child.wait()).await,
                Ok(Ok(_))
            );
            if !reaped {
                warn!(pid = ?pid, "process group did not exit after SIGKILL");
            }
            ProcessExit::TimedOut { reaped }
        }
    };

    // Background children may outlive the group leader and hold the pipes open.
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    running.set(None);

    for mut handle in drains {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
            debug!("output drain did not finish, keeping partial output");
            handle.abort();
        }
    }

    let (stdout, stdout_dropped) = take_buffer(&stdout_buf);
    let (stderr, stderr_dropped) = take_buffer(&stderr_buf);
    Ok(ExecResult {
        exit,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
    })
}

fn abort_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}

fn take_buffer(buffer: &SharedBuffer) -> (Vec<u8>, usize) {
    let mut guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    (std::mem::take(&mut guard.data), guard.dropped)
}

/// Copy a pipe into `buffer` until EOF, forwarding complete lines to
/// `progress` when set.
async fn drain<R>(reader: R, buffer: SharedBuffer, progress: Option<mpsc::Sender<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        };
        let len = chunk.len();
        buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);

        if let Some(tx) = &progress {
            for &byte in chunk {
                if byte == b'\n' {
                    send_line(tx, &mut line).await;
                } else if line.len() < MAX_PROGRESS_LINE {
                    line.push(byte);
                }
            }
        }
        reader.consume(len);
    }
    if let Some(tx) = &progress
        && !line.is_empty()
    {
        send_line(tx, &mut line).await;
    }
}

async fn send_line(tx: &mpsc::Sender<String>, line: &mut Vec<u8>) {
    let text = String::from_utf8_lossy(line).trim_end().to_string();
    line.clear();
    if !text.is_empty() {
        // Receiver gone means nobody is listening; keep draining regardless.
        let _ = tx.send(text).await;
    }
}
