use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "local").
    fn name(&self) -> &str;
    /// Allocate a new sandbox. The returned sandbox is not started yet.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Release everything the sandbox holds (workspace, processes).
    ///
    /// Must tolerate being called for a sandbox that is already partially or
    /// fully torn down.
    async fn destroy(&self, sandbox: &dyn Sandbox);
}
