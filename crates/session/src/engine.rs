use std::sync::Arc;
use std::time::Duration;

use sandbox::{ExecRequest, ProcessExit};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OutputLimits;
use crate::error::{Result, SessionError};
use crate::managed::{ManagedSandbox, SandboxState};
use crate::output;
use crate::registry::SandboxRegistry;
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStatus};

/// Runs scripts inside registry sandboxes, one at a time per sandbox.
pub struct ExecutionEngine {
    registry: Arc<SandboxRegistry>,
    limits: OutputLimits,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<SandboxRegistry>, limits: OutputLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Execute `script` with a hard `timeout`.
    ///
    /// Script failures and timeouts come back as an [`ExecutionResult`] with
    /// the matching status. `Err` means the sandbox could not run anything
    /// (already destroyed, or torn down while this call was queued).
    pub async fn execute(
        &self,
        sandbox: &Arc<ManagedSandbox>,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.run(
            sandbox,
            ExecutionRequest {
                request_id: Uuid::new_v4().to_string(),
                sandbox_id: sandbox.id().to_string(),
                script: script.to_string(),
                timeout,
            },
        )
        .await
    }

    pub async fn run(
        &self,
        sandbox: &Arc<ManagedSandbox>,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        // The run owns its gate permit, so a caller dropping this future
        // can't release the sandbox while the process is still alive.
        let worker = tokio::spawn(run_exclusive(
            Arc::clone(&self.registry),
            Arc::clone(sandbox),
            request,
            self.limits,
        ));
        worker
            .await
            .map_err(|e| SessionError::SandboxUnavailable(format!("execution worker failed: {e}")))?
    }
}

async fn run_exclusive(
    registry: Arc<SandboxRegistry>,
    sandbox: Arc<ManagedSandbox>,
    request: ExecutionRequest,
    limits: OutputLimits,
) -> Result<ExecutionResult> {
    let _permit = Arc::clone(&sandbox.gate).lock_owned().await;
    if !sandbox.transition(SandboxState::Ready, SandboxState::Busy) {
        return Err(SessionError::SandboxUnavailable(format!(
            "sandbox {} is {}",
            sandbox.id(),
            sandbox.state()
        )));
    }

    debug!(sandbox_id = sandbox.id(), request_id = %request.request_id, "execution started");
    let started = Instant::now();
    let backend = {
        let sandbox = Arc::clone(&sandbox);
        let request = request.clone();
        tokio::spawn(async move {
            sandbox
                .inner
                .exec(&ExecRequest {
                    request_id: &request.request_id,
                    script: &request.script,
                    timeout: request.timeout,
                })
                .await
        })
    };
    let outcome = backend.await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut result = ExecutionResult {
        request_id: request.request_id,
        sandbox_id: request.sandbox_id,
        status: ExecutionStatus::Error,
        stdout: String::new(),
        stderr: String::new(),
        structured_outputs: Vec::new(),
        duration_ms,
    };

    let evict = match outcome {
        Ok(Ok(exec)) => {
            let captured = output::collect(
                &exec.stdout,
                exec.stdout_dropped,
                &exec.stderr,
                exec.stderr_dropped,
                &limits,
            );
            result.stdout = captured.stdout;
            result.stderr = captured.stderr;
            result.structured_outputs = captured.structured;

            match exec.exit {
                ProcessExit::Exited(0) => {
                    result.status = ExecutionStatus::Success;
                    false
                }
                ProcessExit::Exited(code) => {
                    if result.stderr.is_empty() {
                        result.stderr = format!("process exited with code {code}");
                    }
                    false
                }
                ProcessExit::Signaled(signal) => {
                    append_line(
                        &mut result.stderr,
                        &format!("[sandbox process crashed: signal {signal}]"),
                    );
                    true
                }
                ProcessExit::TimedOut { reaped } => {
                    result.status = ExecutionStatus::Timeout;
                    if !reaped {
                        warn!(sandbox_id = sandbox.id(), "timed-out process survived SIGKILL");
                    }
                    !reaped
                }
            }
        }
        Ok(Err(e)) => {
            result.stderr = e.to_string();
            true
        }
        Err(join) => {
            result.stderr = format!("sandbox backend failed: {join}");
            true
        }
    };

    if evict {
        warn!(sandbox_id = sandbox.id(), status = ?result.status, "evicting sandbox after failed execution");
        registry.evict(&sandbox).await;
    } else {
        sandbox.transition(SandboxState::Busy, SandboxState::Ready);
        sandbox.touch();
    }

    info!(
        sandbox_id = sandbox.id(),
        request_id = %result.request_id,
        status = ?result.status,
        duration_ms,
        "execution finished"
    );
    Ok(result)
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
}
