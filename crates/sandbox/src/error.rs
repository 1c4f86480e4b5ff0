use std::path::PathBuf;

/// Why a backend could not provide or drive a sandbox.
///
/// A script that fails is not an error here: it comes back as an
/// [`ExecResult`](crate::ExecResult) with a non-zero exit.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// No interpreter for the requested runtime on this host.
    #[error("no interpreter for runtime: {0}")]
    BackendNotAvailable(String),

    /// The backend refused a new sandbox, e.g. out of capacity.
    #[error("sandbox could not be created: {0}")]
    CreationFailed(String),

    /// The interpreter could not be spawned, waited on or signalled.
    #[error("interpreter failed: {0}")]
    ExecFailed(String),

    #[error("bad sandbox config: {0}")]
    InvalidConfig(String),

    /// A sandbox directory or script file could not be written.
    #[error("workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
