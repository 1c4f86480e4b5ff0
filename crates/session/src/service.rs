use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sandbox::{ResourceLimits, SandboxFactory};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::engine::ExecutionEngine;
use crate::error::{Result, SessionError};
use crate::installer::{InstallStream, PackageInstaller};
use crate::managed::ManagedSandbox;
use crate::registry::{RegistryConfig, SandboxRegistry};
use crate::types::{ExecutionResult, SessionInfo};

/// The execution surface callers use: sessions, execution, installs.
///
/// Construct one per process (or per test) and call [`start`](Self::start) /
/// [`shutdown`](Self::shutdown) around its lifetime.
pub struct SessionService {
    registry: Arc<SandboxRegistry>,
    engine: ExecutionEngine,
    installer: PackageInstaller,
    config: SessionConfig,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionService {
    pub fn new(factory: Arc<dyn SandboxFactory>, config: SessionConfig) -> Self {
        let registry = Arc::new(SandboxRegistry::new(
            factory,
            RegistryConfig {
                idle_ttl: config.idle_ttl,
                provision_backoff: config.provision_backoff,
                limits: ResourceLimits {
                    max_stream_bytes: config.limits.capture_bytes(),
                },
            },
        ));
        let engine = ExecutionEngine::new(Arc::clone(&registry), config.limits);
        let installer = PackageInstaller::new(
            Arc::clone(&registry),
            config.install_timeout,
            config.unsupported_packages.iter().cloned(),
        );
        Self {
            registry,
            engine,
            installer,
            config,
            sweeper: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start the idle sweeper. Calling twice is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = self
            .registry
            .spawn_sweeper(self.config.sweep_interval, token.clone());
        *sweeper = Some((token, handle));
        info!(
            idle_ttl_secs = self.config.idle_ttl.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "session service started"
        );
    }

    /// Stop the sweeper and destroy every sandbox.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = sweeper {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "idle sweeper ended abnormally");
            }
        }
        self.registry.shutdown().await;
        info!("session service stopped");
    }

    pub async fn create_session(
        &self,
        project_id: &str,
        runtime_version: Option<&str>,
    ) -> Result<SessionInfo> {
        if project_id.is_empty() {
            return Err(SessionError::InvalidRequest("empty project id".into()));
        }
        let sandbox = self
            .registry
            .acquire(project_id, self.runtime(runtime_version))
            .await?;
        Ok(sandbox.info())
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.registry.get(session_id).map(|s| s.info())
    }

    /// Tear the session down. Returns `false` if it was already gone.
    pub async fn destroy_session(&self, session_id: &str) -> bool {
        self.registry.teardown(session_id).await
    }

    /// Run `code` for a project, in the given session or the project's
    /// sandbox for the runtime version.
    pub async fn execute(
        &self,
        project_id: &str,
        code: &str,
        session_id: Option<&str>,
        runtime_version: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let sandbox = self.resolve(project_id, session_id, runtime_version).await?;
        let timeout = timeout
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout);
        self.engine.execute(&sandbox, code, timeout).await
    }

    /// Stream the installation of `package` into an existing session.
    pub fn install_package(&self, session_id: &str, package: &str) -> Result<InstallStream> {
        let sandbox = self
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        Ok(self.installer.install_stream(sandbox, package))
    }

    async fn resolve(
        &self,
        project_id: &str,
        session_id: Option<&str>,
        runtime_version: Option<&str>,
    ) -> Result<Arc<ManagedSandbox>> {
        match session_id {
            Some(id) => self
                .registry
                .get(id)
                .filter(|s| s.key().project_key == project_id)
                .ok_or_else(|| SessionError::SessionNotFound(id.to_string())),
            None => {
                if project_id.is_empty() {
                    return Err(SessionError::InvalidRequest("empty project id".into()));
                }
                self.registry
                    .acquire(project_id, self.runtime(runtime_version))
                    .await
            }
        }
    }

    fn runtime<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.config.default_runtime)
    }
}
