use std::time::Duration;

pub struct ExecRequest<'a> {
    pub request_id: &'a str,
    pub script: &'a str,
    pub timeout: Duration,
}

pub struct InstallRequest<'a> {
    pub package: &'a str,
    pub timeout: Duration,
}

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with this code.
    Exited(i32),
    /// Killed by a signal it did not ask for (crash, OOM killer, ...).
    Signaled(i32),
    /// Exceeded its timeout and was killed. `reaped` is false when the
    /// process could not be confirmed dead within the kill grace period.
    TimedOut { reaped: bool },
}

pub struct ExecResult {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded from stdout because the capture cap was reached.
    pub stdout_dropped: usize,
    /// Bytes discarded from stderr because the capture cap was reached.
    pub stderr_dropped: usize,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited(0)
    }
}
