use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecResult, InstallRequest, ResourceLimits, Sandbox, SandboxConfig, SandboxError,
};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::paths::SandboxPaths;
use crate::process::{RunOptions, RunningGroup, kill_process_group, run_captured};

pub struct LocalSandbox {
    /// Cached `config.id.to_string()`.
    pub(crate) id: String,
    runtime_version: String,
    pub(crate) paths: SandboxPaths,
    interpreter: PathBuf,
    install_command: Vec<String>,
    limits: ResourceLimits,
    kill_grace: Duration,
    running: RunningGroup,
}

impl LocalSandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        paths: SandboxPaths,
        interpreter: PathBuf,
        install_command: Vec<String>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            id: config.id.to_string(),
            runtime_version: config.runtime_version,
            paths,
            interpreter,
            install_command,
            limits: config.resources,
            kill_grace,
            running: RunningGroup::default(),
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    fn options(&self, timeout: Duration) -> RunOptions {
        RunOptions {
            timeout,
            kill_grace: self.kill_grace,
            max_stream_bytes: self.limits.max_stream_bytes,
        }
    }

    /// Expand the install command template for `package`.
    fn install_args(&self, package: &str) -> Vec<String> {
        let interpreter = self.interpreter.display().to_string();
        let target = self.paths.site_packages().display().to_string();
        self.install_command
            .iter()
            .map(|arg| {
                arg.replace("{interpreter}", &interpreter)
                    .replace("{target}", &target)
                    .replace("{package}", package)
            })
            .collect()
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    fn workspace(&self) -> &Path {
        self.paths.work()
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        for dir in [self.paths.cells(), self.paths.site_packages()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::workspace(&dir, e))?;
        }
        info!(id = %self.id, interpreter = %self.interpreter.display(), "sandbox started");
        Ok(())
    }

    async fn kill(&self) -> sandbox::Result<()> {
        if let Some(pid) = self.running.get()
            && !kill_process_group(pid)
        {
            return Err(SandboxError::ExecFailed(format!(
                "failed to signal process group {pid}"
            )));
        }
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let script_path = self.paths.cell_script(request.request_id);
        tokio::fs::write(&script_path, request.script)
            .await
            .map_err(|e| SandboxError::workspace(&script_path, e))?;

        let mut command = Command::new(&self.interpreter);
        command
            .arg(&script_path)
            .current_dir(self.paths.work())
            .env("PYTHONPATH", self.paths.site_packages())
            .env("PYTHONUNBUFFERED", "1");

        debug!(id = %self.id, request_id = request.request_id, "exec");
        let result = run_captured(command, &self.options(request.timeout), &self.running, None).await;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            warn!(id = %self.id, error = %e, "failed to remove cell script");
        }
        result
    }

    async fn install(
        &self,
        request: &InstallRequest<'_>,
        progress: mpsc::Sender<String>,
    ) -> sandbox::Result<ExecResult> {
        let args = self.install_args(request.package);
        let Some((program, rest)) = args.split_first() else {
            return Err(SandboxError::InvalidConfig("empty install command".into()));
        };

        let mut command = Command::new(program);
        command.args(rest).current_dir(self.paths.work());

        info!(id = %self.id, package = request.package, "installing package");
        run_captured(
            command,
            &self.options(request.timeout),
            &self.running,
            Some(progress),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::ProcessExit;

    fn sandbox_in(dir: &Path) -> LocalSandbox {
        let config = SandboxConfig {
            id: uuid::Uuid::new_v4(),
            project_key: "proj1".into(),
            runtime_version: "3.11".into(),
            resources: ResourceLimits {
                max_stream_bytes: 1000,
            },
        };
        LocalSandbox::new(
            config,
            SandboxPaths::new(dir.to_path_buf()),
            PathBuf::from("/bin/sh"),
            vec![
                "/bin/sh".into(),
                "-c".into(),
                "echo resolving $0; echo installed $0 into $1".into(),
                "{package}".into(),
                "{target}".into(),
            ],
            Duration::from_secs(2),
        )
    }

    async fn exec(sandbox: &LocalSandbox, script: &str, timeout: Duration) -> ExecResult {
        sandbox
            .exec(&ExecRequest {
                request_id: &uuid::Uuid::new_v4().to_string(),
                script,
                timeout,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let result = exec(&sandbox, "echo $((1+1))", Duration::from_secs(5)).await;
        assert!(result.success());
        assert_eq!(String::from_utf8_lossy(&result.stdout), "2\n");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_reports_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let result = exec(&sandbox, "echo boom >&2; exit 3", Duration::from_secs(5)).await;
        assert_eq!(result.exit, ProcessExit::Exited(3));
        assert_eq!(String::from_utf8_lossy(&result.stderr), "boom\n");
    }

    #[tokio::test]
    async fn exec_runs_in_persistent_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        exec(&sandbox, "echo kept > state.txt", Duration::from_secs(5)).await;
        let result = exec(&sandbox, "cat state.txt", Duration::from_secs(5)).await;
        assert_eq!(String::from_utf8_lossy(&result.stdout), "kept\n");
    }

    #[tokio::test]
    async fn exec_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let started = std::time::Instant::now();
        let result = exec(
            &sandbox,
            "echo before; sleep 30 & while :; do :; done",
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(result.exit, ProcessExit::TimedOut { reaped: true });
        assert_eq!(String::from_utf8_lossy(&result.stdout), "before\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exec_reports_signal_death() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let result = exec(&sandbox, "kill -9 $$", Duration::from_secs(5)).await;
        assert_eq!(result.exit, ProcessExit::Signaled(9));
    }

    #[tokio::test]
    async fn exec_caps_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let result = exec(
            &sandbox,
            "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done",
            Duration::from_secs(10),
        )
        .await;
        assert!(result.success());
        assert_eq!(result.stdout.len(), 1000);
        assert_eq!(result.stdout_dropped, 5500 - 1000);
    }

    #[tokio::test]
    async fn install_streams_progress_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = sandbox_in(dir.path());
        sandbox.start().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let result = sandbox
            .install(
                &InstallRequest {
                    package: "numpy",
                    timeout: Duration::from_secs(5),
                },
                tx,
            )
            .await
            .unwrap();
        assert!(result.success());

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "resolving numpy");
        assert!(lines[1].starts_with("installed numpy into "));
        assert!(lines[1].ends_with("site-packages"));
    }
}
