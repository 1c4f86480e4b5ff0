use async_trait::async_trait;
use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{info, warn};

use crate::config::LocalConfig;
use crate::interpreter::resolve_interpreter;
use crate::paths::{FactoryPaths, SandboxPaths};
use crate::sandbox::LocalSandbox;

pub struct LocalFactory {
    config: LocalConfig,
    factory_paths: FactoryPaths,
}

impl LocalFactory {
    /// Create the factory and its base directory.
    pub async fn new(config: LocalConfig) -> Result<Self, SandboxError> {
        if config.install_command.is_empty() {
            return Err(SandboxError::InvalidConfig("empty install command".into()));
        }
        let factory_paths = FactoryPaths::new(config.base_dir.clone());
        let sandboxes = factory_paths.sandboxes();
        tokio::fs::create_dir_all(&sandboxes)
            .await
            .map_err(|e| SandboxError::workspace(sandboxes, e))?;
        Ok(Self {
            config,
            factory_paths,
        })
    }
}

#[async_trait]
impl SandboxFactory for LocalFactory {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        let id = config.id.to_string();
        let interpreter =
            resolve_interpreter(self.config.interpreter.as_deref(), &config.runtime_version)?;
        let paths = SandboxPaths::new(self.factory_paths.sandbox(&id));

        // Clean stale workspace from a previous crashed process reusing the id.
        if paths.root().exists()
            && let Err(e) = tokio::fs::remove_dir_all(paths.root()).await
        {
            warn!(id = %id, error = %e, "failed to clean stale workspace");
        }
        tokio::fs::create_dir_all(paths.work())
            .await
            .map_err(|e| SandboxError::workspace(paths.work(), e))?;

        info!(id = %id, project = %config.project_key, runtime = %config.runtime_version, "sandbox created");

        Ok(Box::new(LocalSandbox::new(
            config,
            paths,
            interpreter,
            self.config.install_command.clone(),
            self.config.kill_grace,
        )))
    }

    async fn destroy(&self, sandbox: &dyn Sandbox) {
        let id = sandbox.id().to_string();

        // Ensure nothing is still running before the workspace disappears.
        if let Err(e) = sandbox.kill().await {
            warn!(id = %id, error = %e, "failed to kill running process");
        }

        let root = self.factory_paths.sandbox(&id);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => info!(id = %id, "sandbox destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(id = %id, error = %e, "failed to delete workspace"),
        }
    }
}
