use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ExecRequest, ExecResult, InstallRequest};

/// Implementations are not required to serialize calls themselves; callers
/// guarantee at most one `exec`/`install` in flight per sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;
    fn runtime_version(&self) -> &str;
    /// Directory scripts run in. Survives across executions.
    fn workspace(&self) -> &Path;

    // -- lifecycle --
    async fn start(&mut self) -> Result<()>;
    /// Forcibly terminate anything still running inside the sandbox.
    async fn kill(&self) -> Result<()>;

    // -- operations --
    async fn exec(&self, request: &ExecRequest<'_>) -> Result<ExecResult>;
    /// Install a package, sending one progress line per output line.
    async fn install(
        &self,
        request: &InstallRequest<'_>,
        progress: mpsc::Sender<String>,
    ) -> Result<ExecResult>;
}
