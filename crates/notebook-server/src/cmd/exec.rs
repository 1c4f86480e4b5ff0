use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use notebook_server::{NotebookConfig, ServerError, ServerResult, config};
use sandbox_local::LocalFactory;
use session::{ExecutionStatus, SessionService};

#[derive(Args)]
pub struct ExecArgs {
    /// Script file to run
    script: PathBuf,
    /// Runtime version, e.g. 3.11
    #[arg(long)]
    runtime: Option<String>,
    /// Hard timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Interpreter to use instead of looking one up on PATH
    #[arg(long)]
    interpreter: Option<PathBuf>,
    /// Take sandbox settings from this config file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Exit code mirrors the execution status.
pub async fn run_exec(args: ExecArgs) -> ServerResult<ExitCode> {
    let code = tokio::fs::read_to_string(&args.script)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", args.script.display())))?;

    let mut notebook_config = match &args.config {
        Some(path) => config::load(path).await?,
        None => NotebookConfig::default(),
    };
    // Without a config the sandbox lives in a throwaway directory.
    let scratch = tempfile::tempdir()?;
    if args.config.is_none() {
        notebook_config.sandbox.base_dir = scratch.path().to_path_buf();
    }
    if let Some(interpreter) = args.interpreter {
        notebook_config.sandbox.interpreter = Some(interpreter);
    }

    let factory = LocalFactory::new(notebook_config.local_config()).await?;
    let sessions = SessionService::new(Arc::new(factory), notebook_config.session_config());
    let result = sessions
        .execute(
            "cli",
            &code,
            None,
            args.runtime.as_deref(),
            args.timeout_ms.map(Duration::from_millis),
        )
        .await;
    sessions.shutdown().await;

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(match result.status {
        ExecutionStatus::Success => ExitCode::SUCCESS,
        ExecutionStatus::Error | ExecutionStatus::Timeout => ExitCode::FAILURE,
    })
}
