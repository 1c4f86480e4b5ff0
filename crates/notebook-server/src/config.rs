use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cell_lock::{LockConfig, RevocationPolicy};
use realtime::HubConfig;
use sandbox_local::{DEFAULT_INSTALL_COMMAND, LocalConfig};
use serde::{Deserialize, Serialize};
use session::{OutputLimits, SessionConfig};

use crate::error::{ServerError, ServerResult};

/// File name written by [`generate`].
pub const CONFIG_FILE: &str = "notebook.yaml";

pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:8787";
pub(crate) const DEFAULT_RUNTIME: &str = "3.11";

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub datasets: DatasetsSection,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub base_dir: PathBuf,
    /// Use this interpreter for every runtime version instead of `PATH` lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_command: Option<Vec<String>>,
    pub default_runtime: String,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub install_timeout_secs: u64,
    pub provision_backoff_ms: u64,
    pub kill_grace_ms: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub max_outputs: usize,
    pub max_output_bytes: usize,
    pub unsupported_packages: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            base_dir: PathBuf::from("sandboxes"),
            interpreter: None,
            install_command: None,
            default_runtime: DEFAULT_RUNTIME.to_string(),
            idle_ttl_secs: session.idle_ttl.as_secs(),
            sweep_interval_secs: session.sweep_interval.as_secs(),
            default_timeout_ms: millis(session.default_timeout),
            max_timeout_ms: millis(session.max_timeout),
            install_timeout_secs: session.install_timeout.as_secs(),
            provision_backoff_ms: millis(session.provision_backoff),
            kill_grace_ms: 2_000,
            max_stdout_bytes: session.limits.max_stdout_bytes,
            max_stderr_bytes: session.limits.max_stderr_bytes,
            max_outputs: session.limits.max_outputs,
            max_output_bytes: session.limits.max_output_bytes,
            unsupported_packages: Vec::new(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub heartbeat_interval_ms: u64,
    pub outbound_buffer: usize,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            heartbeat_interval_ms: millis(hub.heartbeat_interval),
            outbound_buffer: hub.outbound_buffer,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksSection {
    pub agent_ttl_secs: u64,
    /// Unset: human locks last until release or disconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_ttl_secs: Option<u64>,
    pub revocation: RevocationPolicy,
    pub sweep_interval_ms: u64,
}

impl Default for LocksSection {
    fn default() -> Self {
        let locks = LockConfig::default();
        // Outlasts the longest execution the default sandbox section allows.
        let max_timeout = SessionConfig::default().max_timeout;
        Self {
            agent_ttl_secs: locks.agent_ttl.max(max_timeout).as_secs() + 60,
            human_ttl_secs: locks.human_ttl.map(|ttl| ttl.as_secs()),
            revocation: locks.revocation,
            sweep_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetsSection {
    pub dir: PathBuf,
    pub sample_rows: usize,
}

impl Default for DatasetsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("datasets"),
            sample_rows: 5,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Load and validate a config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ServerResult<NotebookConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: NotebookConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    if let Some(interpreter) = &config.sandbox.interpreter {
        check_path_exists(interpreter, "sandbox.interpreter").await?;
    }
    Ok(config)
}

/// Write `config` to `<dir>/notebook.yaml`, creating `dir`. Returns the path.
pub async fn generate(config: &NotebookConfig, dir: &Path) -> ServerResult<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ServerError::Config(format!("create {}: {e}", dir.display())))?;

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| ServerError::Config(format!("serialize config: {e}")))?;

    let config_path = dir.join(CONFIG_FILE);
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| ServerError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

async fn check_path_exists(path: &Path, label: &str) -> ServerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| ServerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(ServerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

impl NotebookConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.sandbox.base_dir);
        resolve(&mut self.datasets.dir);
        if let Some(interpreter) = &mut self.sandbox.interpreter {
            // Bare names like `python3` are looked up on PATH.
            if interpreter.components().count() > 1 {
                resolve(interpreter);
            }
        }
    }

    pub fn validate(&self) -> ServerResult<()> {
        let invalid = |msg: &str| Err(ServerError::Config(msg.to_string()));

        self.listen_addr()?;
        let sandbox = &self.sandbox;
        if sandbox.default_runtime.trim().is_empty() {
            return invalid("sandbox.default_runtime must not be empty");
        }
        if sandbox.default_timeout_ms == 0 || sandbox.max_timeout_ms == 0 {
            return invalid("sandbox timeouts must be positive");
        }
        if sandbox.default_timeout_ms > sandbox.max_timeout_ms {
            return invalid("sandbox.default_timeout_ms exceeds sandbox.max_timeout_ms");
        }
        if sandbox.sweep_interval_secs == 0 || sandbox.idle_ttl_secs == 0 {
            return invalid("sandbox.idle_ttl_secs and sandbox.sweep_interval_secs must be positive");
        }
        if sandbox.max_stdout_bytes == 0 || sandbox.max_stderr_bytes == 0 {
            return invalid("sandbox output caps must be positive");
        }
        if let Some(command) = &sandbox.install_command
            && !command.iter().any(|part| part.contains("{package}"))
        {
            return invalid("sandbox.install_command must contain {package}");
        }
        if self.realtime.heartbeat_interval_ms == 0 || self.realtime.outbound_buffer == 0 {
            return invalid("realtime.heartbeat_interval_ms and realtime.outbound_buffer must be positive");
        }
        if self.locks.agent_ttl_secs == 0 || self.locks.sweep_interval_ms == 0 {
            return invalid("locks.agent_ttl_secs and locks.sweep_interval_ms must be positive");
        }
        if self.locks.agent_ttl_secs.saturating_mul(1_000) <= sandbox.max_timeout_ms {
            return invalid("locks.agent_ttl_secs must exceed sandbox.max_timeout_ms");
        }
        if self.locks.human_ttl_secs == Some(0) {
            return invalid("locks.human_ttl_secs must be positive when set");
        }
        if self.datasets.sample_rows == 0 {
            return invalid("datasets.sample_rows must be positive");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> ServerResult<SocketAddr> {
        self.server
            .listen
            .parse()
            .map_err(|e| ServerError::Config(format!("server.listen '{}': {e}", self.server.listen)))
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.sandbox;
        SessionConfig {
            default_runtime: s.default_runtime.clone(),
            idle_ttl: Duration::from_secs(s.idle_ttl_secs),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs),
            default_timeout: Duration::from_millis(s.default_timeout_ms),
            max_timeout: Duration::from_millis(s.max_timeout_ms),
            provision_backoff: Duration::from_millis(s.provision_backoff_ms),
            install_timeout: Duration::from_secs(s.install_timeout_secs),
            unsupported_packages: s.unsupported_packages.clone(),
            limits: OutputLimits {
                max_stdout_bytes: s.max_stdout_bytes,
                max_stderr_bytes: s.max_stderr_bytes,
                max_outputs: s.max_outputs,
                max_output_bytes: s.max_output_bytes,
            },
        }
    }

    pub fn local_config(&self) -> LocalConfig {
        let mut local = LocalConfig::new(self.sandbox.base_dir.clone());
        local.interpreter = self.sandbox.interpreter.clone();
        if let Some(command) = &self.sandbox.install_command {
            local.install_command = command.clone();
        }
        local.kill_grace = Duration::from_millis(self.sandbox.kill_grace_ms);
        local
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_millis(self.realtime.heartbeat_interval_ms),
            outbound_buffer: self.realtime.outbound_buffer,
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            agent_ttl: Duration::from_secs(self.locks.agent_ttl_secs),
            human_ttl: self.locks.human_ttl_secs.map(Duration::from_secs),
            revocation: self.locks.revocation,
        }
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.locks.sweep_interval_ms)
    }
}

/// Default install command, for display in generated configs.
pub fn default_install_command() -> Vec<String> {
    DEFAULT_INSTALL_COMMAND
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
