use std::path::PathBuf;

use clap::Args;
use notebook_server::{NotebookServer, ServerResult, config};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// Path to notebook.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Listen address (overrides config)
    #[arg(long, env = "NOTEBOOK_LISTEN")]
    listen: Option<String>,
}

/// Load config and serve until SIGTERM or SIGINT.
pub async fn run_serve(args: ServeArgs) -> ServerResult<()> {
    let mut notebook_config = config::load(&args.config).await?;
    if let Some(listen) = args.listen {
        notebook_config.server.listen = listen;
        notebook_config.validate()?;
    }

    let server = NotebookServer::new(notebook_config).await?;
    let listener = server.bind().await?;
    info!(addr = ?listener.local_addr().ok(), "listening");

    let shutdown = CancellationToken::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => info!("received SIGTERM, stopping"),
            _ = recv_signal(&mut sigint) => info!("received SIGINT, stopping"),
            _ = signals.cancelled() => {}
        }
        signals.cancel();
    });

    server.run(listener, shutdown).await;
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
