use std::sync::Arc;

use cell_lock::CellLockManager;
use realtime::{Hub, InboundHandler};
use sandbox::SandboxFactory;
use sandbox_local::LocalFactory;
use session::SessionService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::collab::Collaboration;
use crate::config::NotebookConfig;
use crate::datasets::{DatasetRepository, FsDatasetRepository};
use crate::error::ServerResult;
use crate::pipeline::FeaturePipeline;

/// Every service of one server process, wired together.
pub struct NotebookServer {
    config: NotebookConfig,
    sessions: Arc<SessionService>,
    locks: Arc<CellLockManager>,
    hub: Arc<Hub>,
    collab: Arc<Collaboration>,
    pipeline: Arc<FeaturePipeline>,
    agents: Arc<AgentRunner>,
}

impl NotebookServer {
    /// Build a server backed by local subprocess sandboxes and datasets on disk.
    pub async fn new(config: NotebookConfig) -> ServerResult<Self> {
        config.validate()?;
        let factory = LocalFactory::new(config.local_config()).await?;
        let datasets = FsDatasetRepository::new(config.datasets.dir.clone()).await?;
        Ok(Self::with_parts(config, Arc::new(factory), Arc::new(datasets)))
    }

    pub fn with_parts(
        config: NotebookConfig,
        factory: Arc<dyn SandboxFactory>,
        datasets: Arc<dyn DatasetRepository>,
    ) -> Self {
        let sessions = Arc::new(SessionService::new(factory, config.session_config()));
        let locks = Arc::new(CellLockManager::new(config.lock_config()));
        let hub = Arc::new(Hub::new(config.hub_config()));
        let collab = Arc::new(Collaboration::new(
            Arc::clone(&hub),
            Arc::clone(&locks),
            Arc::clone(&sessions),
        ));
        let pipeline = Arc::new(FeaturePipeline::new(
            Arc::clone(&sessions),
            datasets,
            config.datasets.sample_rows,
        ));
        let agents = Arc::new(AgentRunner::new(Arc::clone(&collab), Arc::clone(&pipeline)));
        Self {
            config,
            sessions,
            locks,
            hub,
            collab,
            pipeline,
            agents,
        }
    }

    pub fn config(&self) -> &NotebookConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn locks(&self) -> &Arc<CellLockManager> {
        &self.locks
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn collab(&self) -> &Arc<Collaboration> {
        &self.collab
    }

    pub fn pipeline(&self) -> &Arc<FeaturePipeline> {
        &self.pipeline
    }

    pub fn agents(&self) -> &Arc<AgentRunner> {
        &self.agents
    }

    pub async fn bind(&self) -> ServerResult<TcpListener> {
        Ok(realtime::bind(self.config.listen_addr()?).await?)
    }

    /// Serve until `shutdown` is cancelled, then stop background tasks and
    /// destroy every sandbox.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) {
        self.sessions.start();
        let mut background = self
            .collab
            .spawn(self.config.lock_sweep_interval(), shutdown.clone());
        background.push(self.hub.run_heartbeat(shutdown.clone()));
        info!(
            heartbeat_ms = self.config.realtime.heartbeat_interval_ms,
            revocation = ?self.config.locks.revocation,
            "notebook server started"
        );

        realtime::serve(
            listener,
            Arc::clone(&self.hub),
            Arc::clone(&self.collab) as Arc<dyn InboundHandler>,
            shutdown.clone(),
        )
        .await;

        shutdown.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.sessions.shutdown().await;
        info!("notebook server stopped");
    }
}
