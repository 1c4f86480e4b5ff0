use std::path::PathBuf;

use clap::Args;
use notebook_server::config::{self, CONFIG_FILE, NotebookConfig, SandboxSection};
use notebook_server::{ServerError, ServerResult};

#[derive(Args)]
pub struct InitConfigArgs {
    /// Directory to write notebook.yaml into
    dir: PathBuf,
    /// Overwrite an existing config
    #[arg(long)]
    force: bool,
}

pub async fn run_init_config(args: InitConfigArgs) -> ServerResult<()> {
    let target = args.dir.join(CONFIG_FILE);
    if !args.force && tokio::fs::try_exists(&target).await? {
        return Err(ServerError::Config(format!(
            "{} already exists (use --force to overwrite)",
            target.display()
        )));
    }

    let defaults = NotebookConfig {
        sandbox: SandboxSection {
            install_command: Some(config::default_install_command()),
            ..Default::default()
        },
        ..Default::default()
    };
    let path = config::generate(&defaults, &args.dir).await?;
    println!("{}", path.display());
    Ok(())
}
