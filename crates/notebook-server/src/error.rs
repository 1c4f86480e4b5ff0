#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error(transparent)]
    Session(#[from] session::SessionError),

    #[error("feature compile error: {0}")]
    Compile(#[from] feature_compiler::CompileError),

    #[error("realtime error: {0}")]
    Realtime(#[from] realtime::HubError),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
