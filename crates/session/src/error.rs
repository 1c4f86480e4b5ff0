#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("execution timed out after {duration_ms}ms in sandbox {sandbox_id}")]
    ExecutionTimeout { sandbox_id: String, duration_ms: u64 },

    #[error("execution failed: {stderr}")]
    ExecutionError { stderr: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
