/// Per-sandbox capture limits applied by the backend while a process runs.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Bytes kept per output stream; anything beyond is counted, not stored.
    pub max_stream_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_stream_bytes: 1024 * 1024,
        }
    }
}

pub struct SandboxConfig {
    pub id: uuid::Uuid,
    /// Project the sandbox belongs to.
    pub project_key: String,
    /// Interpreter runtime version (e.g. `"3.11"`).
    pub runtime_version: String,
    pub resources: ResourceLimits,
}
