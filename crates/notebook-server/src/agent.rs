//! Agent tool calls against a notebook.
//!
//! A turn is an ordered batch of [`AgentTool`] calls. Cell-touching calls
//! take the cell lock through the turn first and report
//! [`ToolOutcome::Locked`] when someone else holds it. All locks are
//! released when the turn completes, fails or is cancelled.

use std::sync::Arc;
use std::time::Duration;

use cell_lock::{AcquireOutcome, AgentTurn, LockOwner};
use feature_compiler::FeatureSpec;
use realtime::{EventKind, NotebookEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::{ExecutionResult, InstallEvent};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::Collaboration;
use crate::pipeline::{FeaturePipeline, FeaturePipelineOutput};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentTool {
    UpdateCell {
        cell_id: String,
        source: String,
    },
    ExecuteCell {
        cell_id: String,
        code: String,
    },
    InstallPackage {
        package: String,
    },
    EngineerFeatures {
        dataset_ref: String,
        features: Vec<FeatureSpec>,
    },
}

impl AgentTool {
    /// The cell this call writes to, if any.
    pub fn cell_id(&self) -> Option<&str> {
        match self {
            Self::UpdateCell { cell_id, .. } | Self::ExecuteCell { cell_id, .. } => Some(cell_id),
            Self::InstallPackage { .. } | Self::EngineerFeatures { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ToolOutcome {
    Updated {
        cell_id: String,
    },
    Executed {
        cell_id: String,
        result: ExecutionResult,
    },
    Installed {
        package: String,
        success: bool,
        message: String,
    },
    FeaturesEngineered {
        output: FeaturePipelineOutput,
    },
    /// The cell is locked by someone else; nothing was changed.
    Locked {
        cell_id: String,
        owner: LockOwner,
    },
    Failed {
        message: String,
    },
    /// The turn was cancelled before or during this call.
    Cancelled,
}

/// Runs agent turns for every notebook.
pub struct AgentRunner {
    collab: Arc<Collaboration>,
    pipeline: Arc<FeaturePipeline>,
    /// How often a turn's locks are refreshed while a call is in flight.
    keepalive: Duration,
}

impl AgentRunner {
    pub fn new(collab: Arc<Collaboration>, pipeline: Arc<FeaturePipeline>) -> Self {
        let keepalive = (collab.locks().config().agent_ttl / 3).max(Duration::from_millis(10));
        Self {
            collab,
            pipeline,
            keepalive,
        }
    }

    /// Run `calls` in order. Returns one outcome per call; calls after a
    /// cancellation report [`ToolOutcome::Cancelled`].
    pub async fn run_turn(
        &self,
        agent_id: &str,
        notebook_id: &str,
        calls: Vec<AgentTool>,
        cancel: CancellationToken,
    ) -> Vec<ToolOutcome> {
        let locks = self.collab.locks();
        let mut turn = locks.begin_turn(agent_id);
        let owner = turn.owner().clone();
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outcomes = Vec::with_capacity(calls.len());
        info!(agent_id, notebook_id, calls = calls.len(), "agent turn started");

        for call in calls {
            if cancel.is_cancelled() {
                outcomes.push(ToolOutcome::Cancelled);
                continue;
            }
            // Locks must not lapse while a call waits on a queued or
            // long-running execution.
            let dispatch = self.dispatch(&mut turn, notebook_id, call);
            tokio::pin!(dispatch);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut dispatch => break outcome,
                    _ = keepalive.tick() => {
                        let refreshed = locks.heartbeat(&owner);
                        debug!(agent_id, refreshed, "agent locks refreshed");
                    }
                    _ = cancel.cancelled() => break ToolOutcome::Cancelled,
                }
            };
            outcomes.push(outcome);
        }

        let released = turn.finish();
        info!(agent_id, notebook_id, released, "agent turn finished");
        outcomes
    }

    async fn dispatch(
        &self,
        turn: &mut AgentTurn,
        notebook_id: &str,
        call: AgentTool,
    ) -> ToolOutcome {
        if let Some(cell_id) = call.cell_id() {
            self.collab.track_cell(cell_id, notebook_id);
            if let AcquireOutcome::Denied { owner } = turn.try_acquire(cell_id) {
                debug!(cell_id, holder = %owner, "agent tool blocked by lock");
                return ToolOutcome::Locked {
                    cell_id: cell_id.to_string(),
                    owner,
                };
            }
        }

        match call {
            AgentTool::UpdateCell { cell_id, source } => {
                self.publish(
                    notebook_id,
                    EventKind::CellUpdated,
                    json!({ "cellId": cell_id, "source": source, "actor": turn.owner() }),
                );
                ToolOutcome::Updated { cell_id }
            }
            AgentTool::ExecuteCell { cell_id, code } => {
                let result = self
                    .collab
                    .sessions()
                    .execute(notebook_id, &code, None, None, None)
                    .await;
                turn.heartbeat();
                match result {
                    Ok(result) => {
                        self.publish(
                            notebook_id,
                            EventKind::ExecutionResult,
                            json!({ "cellId": cell_id, "result": result }),
                        );
                        ToolOutcome::Executed { cell_id, result }
                    }
                    Err(e) => {
                        self.publish(
                            notebook_id,
                            EventKind::ExecutionResult,
                            json!({ "cellId": cell_id, "error": e.to_string() }),
                        );
                        ToolOutcome::Failed {
                            message: e.to_string(),
                        }
                    }
                }
            }
            AgentTool::InstallPackage { package } => {
                self.install(turn, notebook_id, package).await
            }
            AgentTool::EngineerFeatures {
                dataset_ref,
                features,
            } => {
                match self
                    .pipeline
                    .run(notebook_id, &dataset_ref, &features, None)
                    .await
                {
                    Ok(output) => {
                        self.publish(
                            notebook_id,
                            EventKind::FeatureMetadata,
                            json!({
                                "sourceRef": output.source_ref,
                                "datasetRef": output.dataset_ref,
                                "metadata": output.metadata,
                            }),
                        );
                        ToolOutcome::FeaturesEngineered { output }
                    }
                    Err(e) => {
                        warn!(notebook_id, dataset_ref = %dataset_ref, error = %e, "feature pipeline failed");
                        ToolOutcome::Failed {
                            message: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn install(&self, turn: &AgentTurn, notebook_id: &str, package: String) -> ToolOutcome {
        let sessions = self.collab.sessions();
        let session = match sessions.create_session(notebook_id, None).await {
            Ok(session) => session,
            Err(e) => {
                return ToolOutcome::Failed {
                    message: e.to_string(),
                };
            }
        };
        let mut stream = match sessions.install_package(&session.id, &package) {
            Ok(stream) => stream,
            Err(e) => {
                return ToolOutcome::Failed {
                    message: e.to_string(),
                };
            }
        };

        while let Some(event) = stream.next().await {
            turn.heartbeat();
            match event {
                InstallEvent::Progress { message } => {
                    self.publish(
                        notebook_id,
                        EventKind::InstallProgress,
                        json!({ "package": package, "message": message }),
                    );
                }
                InstallEvent::Done { success, message } => {
                    self.publish(
                        notebook_id,
                        EventKind::InstallProgress,
                        json!({
                            "package": package,
                            "done": true,
                            "success": success,
                            "message": message,
                        }),
                    );
                    return ToolOutcome::Installed {
                        package,
                        success,
                        message,
                    };
                }
            }
        }
        ToolOutcome::Failed {
            message: "install stream ended without a result".to_string(),
        }
    }

    fn publish(&self, notebook_id: &str, kind: EventKind, payload: serde_json::Value) {
        self.collab
            .hub()
            .broadcast(&NotebookEvent::new(kind, notebook_id, payload));
    }
}
