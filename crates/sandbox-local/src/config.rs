use std::path::PathBuf;
use std::time::Duration;

/// Install command used when none is configured.
///
/// Placeholders: `{interpreter}`, `{target}` (the sandbox's package
/// directory), `{package}`.
pub const DEFAULT_INSTALL_COMMAND: &[&str] = &[
    "{interpreter}",
    "-m",
    "pip",
    "install",
    "--disable-pip-version-check",
    "--no-input",
    "--target",
    "{target}",
    "{package}",
];

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Base directory for sandbox workspaces.
    pub base_dir: PathBuf,
    /// Fixed interpreter for every runtime version. When unset, the
    /// interpreter is looked up on `PATH` per runtime version.
    pub interpreter: Option<PathBuf>,
    /// Install command template, see [`DEFAULT_INSTALL_COMMAND`].
    pub install_command: Vec<String>,
    /// How long to wait for a killed process group to be reaped.
    pub kill_grace: Duration,
}

impl LocalConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            interpreter: None,
            install_command: DEFAULT_INSTALL_COMMAND
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            kill_grace: Duration::from_secs(2),
        }
    }
}
