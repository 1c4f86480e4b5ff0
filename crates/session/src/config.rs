use std::time::Duration;

/// Caps applied to what an execution hands back to callers.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    /// Maximum number of structured outputs per execution.
    pub max_outputs: usize,
    /// Maximum serialized size of all structured outputs together.
    pub max_output_bytes: usize,
}

impl OutputLimits {
    /// Bytes the backend must capture per stream so both plain text and
    /// structured outputs (which travel on stdout) fit their caps.
    pub fn capture_bytes(&self) -> usize {
        self.max_stdout_bytes
            .max(self.max_stderr_bytes)
            .saturating_add(self.max_output_bytes)
    }
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_stdout_bytes: 64 * 1024,
            max_stderr_bytes: 64 * 1024,
            max_outputs: 32,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Runtime used when a caller doesn't name one.
    pub default_runtime: String,
    /// Idle sandboxes are destroyed this long after their last use.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub default_timeout: Duration,
    /// Requested timeouts are clamped to this.
    pub max_timeout: Duration,
    /// Delay before the single internal provisioning retry.
    pub provision_backoff: Duration,
    pub install_timeout: Duration,
    /// Packages that can never be installed in this sandbox class.
    pub unsupported_packages: Vec<String>,
    pub limits: OutputLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_runtime: "3.11".to_string(),
            idle_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            provision_backoff: Duration::from_millis(500),
            install_timeout: Duration::from_secs(300),
            unsupported_packages: Vec::new(),
            limits: OutputLimits::default(),
        }
    }
}
