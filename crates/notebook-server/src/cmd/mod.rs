mod compile;
mod exec;
mod init;
mod serve;

pub use compile::{CompileArgs, run_compile};
pub use exec::{ExecArgs, run_exec};
pub use init::{InitConfigArgs, run_init_config};
pub use serve::{ServeArgs, run_serve};
