//! Execution sessions: a registry of reusable sandboxes keyed by
//! (project, runtime version), an engine that runs one script at a time per
//! sandbox, and a streaming package installer.

mod config;
mod engine;
mod error;
mod installer;
mod managed;
mod output;
mod registry;
mod service;
mod types;

pub use config::{OutputLimits, SessionConfig};
pub use engine::ExecutionEngine;
pub use error::{Result, SessionError};
pub use installer::{InstallStream, PackageInstaller, normalize_package};
pub use managed::{ManagedSandbox, SandboxKey, SandboxState};
pub use output::OUTPUT_MARKER;
pub use registry::{RegistryConfig, SandboxRegistry};
pub use service::SessionService;
pub use types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, InstallEvent, SessionInfo, StructuredOutput,
};
