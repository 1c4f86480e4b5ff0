#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecResult, InstallRequest, ProcessExit, Sandbox, SandboxConfig, SandboxError,
    SandboxFactory,
};
use session::{SessionConfig, SessionService};
use tokio::sync::mpsc;

/// Records how many backend calls are in flight at once.
#[derive(Default)]
pub struct Activity {
    active: AtomicUsize,
    max_active: AtomicUsize,
    pub execs: AtomicUsize,
    pub installs: AtomicUsize,
}

impl Activity {
    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a Activity);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory whose sandboxes interpret a tiny line-based script language:
///
/// - `print:<text>` writes a stdout line
/// - `fail:<text>` writes a stderr line and exits 1
/// - `sleep:<ms>` sleeps, honouring the timeout
/// - `crash` dies from SIGKILL
/// - `wedge` times out without the process being reaped
/// - `error` makes the backend itself fail
///
/// Installing a package named `broken` fails; anything else succeeds.
pub struct MockFactory {
    pub activity: Arc<Activity>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub create_delay: Duration,
    /// Number of upcoming `create` calls that fail.
    pub fail_creates: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            activity: Arc::new(Activity::default()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            fail_creates: AtomicUsize::new(0),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn failing(self, count: usize) -> Self {
        self.fail_creates.store(count, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxFactory for MockFactory {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let should_fail = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SandboxError::CreationFailed("mock capacity exhausted".into()));
        }
        Ok(Box::new(MockSandbox {
            id: config.id.to_string(),
            runtime_version: config.runtime_version,
            workspace: PathBuf::from("/nonexistent"),
            activity: Arc::clone(&self.activity),
        }))
    }

    async fn destroy(&self, _sandbox: &dyn Sandbox) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockSandbox {
    id: String,
    runtime_version: String,
    workspace: PathBuf,
    activity: Arc<Activity>,
}

fn exited(code: i32, stdout: String, stderr: String) -> ExecResult {
    ExecResult {
        exit: ProcessExit::Exited(code),
        stdout: stdout.into_bytes(),
        stderr: stderr.into_bytes(),
        stdout_dropped: 0,
        stderr_dropped: 0,
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn kill(&self) -> sandbox::Result<()> {
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let _active = self.activity.enter();
        self.activity.execs.fetch_add(1, Ordering::SeqCst);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut remaining = request.timeout;
        for line in request.script.lines() {
            let (op, arg) = line.split_once(':').unwrap_or((line, ""));
            match op {
                "print" => {
                    stdout.push_str(arg);
                    stdout.push('\n');
                }
                "fail" => {
                    stderr.push_str(arg);
                    stderr.push('\n');
                    return Ok(exited(1, stdout, stderr));
                }
                "sleep" => {
                    let wanted = Duration::from_millis(arg.parse().unwrap_or(0));
                    if wanted > remaining {
                        tokio::time::sleep(remaining).await;
                        let mut result = exited(0, stdout, stderr);
                        result.exit = ProcessExit::TimedOut { reaped: true };
                        return Ok(result);
                    }
                    tokio::time::sleep(wanted).await;
                    remaining -= wanted;
                }
                "crash" => {
                    let mut result = exited(0, stdout, "Segmentation fault\n".into());
                    result.exit = ProcessExit::Signaled(9);
                    return Ok(result);
                }
                "wedge" => {
                    tokio::time::sleep(remaining).await;
                    let mut result = exited(0, stdout, stderr);
                    result.exit = ProcessExit::TimedOut { reaped: false };
                    return Ok(result);
                }
                "error" => return Err(SandboxError::ExecFailed("backend exploded".into())),
                _ => {}
            }
        }
        Ok(exited(0, stdout, stderr))
    }

    async fn install(
        &self,
        request: &InstallRequest<'_>,
        progress: mpsc::Sender<String>,
    ) -> sandbox::Result<ExecResult> {
        let _active = self.activity.enter();
        self.activity.installs.fetch_add(1, Ordering::SeqCst);

        let _ = progress.send(format!("Collecting {}", request.package)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        if request.package == "broken" {
            return Ok(exited(
                1,
                String::new(),
                "ERROR: No matching distribution found for broken\n".into(),
            ));
        }
        let _ = progress
            .send(format!("Successfully installed {}", request.package))
            .await;
        Ok(exited(0, String::new(), String::new()))
    }
}

pub fn service(factory: Arc<MockFactory>) -> SessionService {
    service_with(factory, SessionConfig::default())
}

pub fn service_with(factory: Arc<MockFactory>, config: SessionConfig) -> SessionService {
    SessionService::new(factory, config)
}

/// Poll `condition` every millisecond until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}
