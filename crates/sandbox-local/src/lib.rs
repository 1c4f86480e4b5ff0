//! Local subprocess sandbox backend.
//!
//! Each sandbox is a directory under the factory's base dir. Scripts run as
//! interpreter subprocesses in their own process group so a timeout can take
//! down everything the script spawned.

mod config;
mod factory;
mod interpreter;
mod paths;
mod process;
mod sandbox;

pub use config::{DEFAULT_INSTALL_COMMAND, LocalConfig};
pub use factory::LocalFactory;
pub use interpreter::resolve_interpreter;
pub use paths::{FactoryPaths, SandboxPaths};
pub use sandbox::LocalSandbox;
