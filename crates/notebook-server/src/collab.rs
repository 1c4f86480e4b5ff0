//! Collaboration glue between the realtime hub, the cell lock table and the
//! execution sessions.
//!
//! - Human lock requests from sockets go through [`CellLockManager`]; a lost
//!   race answers the requester with `lock_denied`.
//! - Every lock change is broadcast as a `lock_changed` event to the
//!   notebook the cell belongs to.
//! - When an actor's last connection goes away, its human locks are released.
//! - `execute_cell` runs off the socket read path and publishes an
//!   `execution_result` event.
//!
//! A notebook id doubles as the project id for sandbox selection.

use std::sync::Arc;

use async_trait::async_trait;
use cell_lock::{CellLockManager, LockChange, LockOwner, OwnerKind};
use dashmap::DashMap;
use realtime::{
    Command, ConnectionInfo, EventKind, Hub, InboundHandler, NotebookEvent, PresenceEvent,
    ServerMessage,
};
use serde_json::json;
use session::SessionService;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Collaboration {
    hub: Arc<Hub>,
    locks: Arc<CellLockManager>,
    sessions: Arc<SessionService>,
    /// cell id -> notebook id, learned from lock and execute requests.
    /// Entries of unlocked cells in notebooks nobody watches are pruned.
    cells: DashMap<String, String>,
}

impl Collaboration {
    pub fn new(hub: Arc<Hub>, locks: Arc<CellLockManager>, sessions: Arc<SessionService>) -> Self {
        Self {
            hub,
            locks,
            sessions,
            cells: DashMap::new(),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn locks(&self) -> &Arc<CellLockManager> {
        &self.locks
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn track_cell(&self, cell_id: &str, notebook_id: &str) {
        self.cells
            .insert(cell_id.to_string(), notebook_id.to_string());
    }

    pub fn notebook_of(&self, cell_id: &str) -> Option<String> {
        self.cells.get(cell_id).map(|nb| nb.value().clone())
    }

    /// Number of cells currently mapped to a notebook.
    pub fn tracked_cells(&self) -> usize {
        self.cells.len()
    }

    /// Forget unlocked cells whose notebook has no subscribers. Returns how
    /// many were dropped.
    pub fn prune_cells(&self) -> usize {
        let before = self.cells.len();
        self.cells.retain(|cell_id, notebook_id| self.is_watched(cell_id, notebook_id));
        before.saturating_sub(self.cells.len())
    }

    fn forget_cell(&self, cell_id: &str) {
        self.cells
            .remove_if(cell_id, |cell_id, notebook_id| !self.is_watched(cell_id, notebook_id));
    }

    fn is_watched(&self, cell_id: &str, notebook_id: &str) -> bool {
        self.hub.subscriber_count(notebook_id) > 0 || self.locks.is_cell_locked(cell_id)
    }

    pub fn is_cell_locked(&self, cell_id: &str) -> bool {
        self.locks.is_cell_locked(cell_id)
    }

    pub fn get_cell_lock_owner(&self, cell_id: &str) -> Option<OwnerKind> {
        self.locks.get_cell_lock_owner(cell_id)
    }

    /// Broadcast a lock change to the cell's notebook. Returns the number of
    /// connections it was queued for.
    pub fn publish_lock_change(&self, change: &LockChange) -> usize {
        let Some(notebook_id) = self.notebook_of(&change.cell_id) else {
            debug!(cell_id = %change.cell_id, "lock change for untracked cell");
            return 0;
        };
        match serde_json::to_value(change) {
            Ok(payload) => self.hub.broadcast(&NotebookEvent::new(
                EventKind::LockChanged,
                notebook_id,
                payload,
            )),
            Err(e) => {
                warn!(error = %e, "failed to serialize lock change");
                0
            }
        }
    }

    /// Release the actor's human locks unless it still has a live connection.
    pub fn release_if_absent(&self, actor_id: &str) -> Vec<String> {
        if self.hub.actor_connections(actor_id) > 0 {
            return Vec::new();
        }
        let released = self.locks.release_all_for(&LockOwner::human(actor_id));
        if !released.is_empty() {
            info!(actor_id, cells = released.len(), "released locks of departed actor");
        }
        released
    }

    /// Spawn the lock-change forwarder, the presence watcher and the lock
    /// expiry sweeper.
    pub fn spawn(
        self: &Arc<Self>,
        lock_sweep_interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        // Subscribe before spawning so nothing published meanwhile is lost.
        let changes = self.locks.subscribe();
        let presence = self.hub.subscribe_presence();
        vec![
            tokio::spawn(Arc::clone(self).forward_lock_changes(changes, shutdown.clone())),
            tokio::spawn(Arc::clone(self).watch_presence(presence, shutdown.clone())),
            self.locks.spawn_sweeper(lock_sweep_interval, shutdown),
        ]
    }

    async fn forward_lock_changes(
        self: Arc<Self>,
        mut changes: tokio::sync::broadcast::Receiver<LockChange>,
        shutdown: CancellationToken,
    ) {
        loop {
            let change = tokio::select! {
                change = changes.recv() => change,
                _ = shutdown.cancelled() => return,
            };
            match change {
                Ok(change) => {
                    self.publish_lock_change(&change);
                    if change.owner.is_none() {
                        self.forget_cell(&change.cell_id);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "lock change forwarder lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn watch_presence(
        self: Arc<Self>,
        mut presence: tokio::sync::broadcast::Receiver<PresenceEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = presence.recv() => event,
                _ = shutdown.cancelled() => return,
            };
            match event {
                Ok(PresenceEvent::Disconnected {
                    actor_id, reason, ..
                }) => {
                    debug!(actor_id = %actor_id, ?reason, "actor connection closed");
                    self.release_if_absent(&actor_id);
                    let pruned = self.prune_cells();
                    if pruned > 0 {
                        debug!(pruned, "forgot cells of unwatched notebooks");
                    }
                }
                Ok(PresenceEvent::Connected { .. }) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "presence watcher lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn deny(
        &self,
        hub: &Hub,
        connection: &ConnectionInfo,
        notebook_id: &str,
        cell_id: &str,
        owner: &LockOwner,
    ) {
        debug!(connection_id = %connection.id, cell_id, holder = %owner, "lock denied");
        hub.send_to(
            &connection.id,
            &ServerMessage::LockDenied {
                notebook_id: notebook_id.to_string(),
                payload: json!({ "cellId": cell_id, "owner": owner }),
            },
        );
    }
}

#[async_trait]
impl InboundHandler for Collaboration {
    async fn handle(&self, hub: &Hub, connection: &ConnectionInfo, command: Command) {
        let owner = LockOwner::human(&connection.actor_id);
        match command {
            Command::LockCell {
                notebook_id,
                cell_id,
            } => {
                self.track_cell(&cell_id, &notebook_id);
                if let cell_lock::AcquireOutcome::Denied { owner: holder } =
                    self.locks.try_acquire(&cell_id, &owner)
                {
                    self.deny(hub, connection, &notebook_id, &cell_id, &holder);
                }
            }
            Command::UnlockCell { cell_id, .. } => {
                // Not holding it is fine: duplicate or late unlock.
                self.locks.release(&cell_id, &owner);
            }
            Command::ExecuteCell {
                notebook_id,
                cell_id,
                code,
            } => {
                self.track_cell(&cell_id, &notebook_id);
                if let Some(lock) = self.locks.lock(&cell_id)
                    && lock.owner != owner
                {
                    self.deny(hub, connection, &notebook_id, &cell_id, &lock.owner);
                    return;
                }
                tokio::spawn(run_cell(
                    Arc::clone(&self.hub),
                    Arc::clone(&self.sessions),
                    notebook_id,
                    cell_id,
                    code,
                ));
            }
        }
    }
}

/// Execute a cell and publish the outcome to its notebook.
async fn run_cell(
    hub: Arc<Hub>,
    sessions: Arc<SessionService>,
    notebook_id: String,
    cell_id: String,
    code: String,
) {
    let payload = match sessions.execute(&notebook_id, &code, None, None, None).await {
        Ok(result) => json!({ "cellId": cell_id, "result": result }),
        Err(e) => {
            warn!(notebook_id = %notebook_id, cell_id = %cell_id, error = %e, "cell execution failed");
            json!({ "cellId": cell_id, "error": e.to_string() })
        }
    };
    hub.broadcast(&NotebookEvent::new(
        EventKind::ExecutionResult,
        notebook_id,
        payload,
    ));
}
