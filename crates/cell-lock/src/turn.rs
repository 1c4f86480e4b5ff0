use std::sync::Arc;

use tracing::debug;

use crate::manager::CellLockManager;
use crate::types::{AcquireOutcome, LockOwner};

/// Locks taken during one agent turn.
///
/// Every lock acquired through the turn is released when the turn is
/// finished or dropped, so a cancelled or failed turn can't leave cells
/// locked.
pub struct AgentTurn {
    manager: Arc<CellLockManager>,
    owner: LockOwner,
    held: Vec<String>,
}

impl AgentTurn {
    pub(crate) fn new(manager: Arc<CellLockManager>, owner: LockOwner) -> Self {
        Self {
            manager,
            owner,
            held: Vec::new(),
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn held(&self) -> &[String] {
        &self.held
    }

    pub fn try_acquire(&mut self, cell_id: &str) -> AcquireOutcome {
        let outcome = self.manager.try_acquire(cell_id, &self.owner);
        if outcome.is_granted() && !self.held.iter().any(|c| c == cell_id) {
            self.held.push(cell_id.to_string());
        }
        outcome
    }

    pub fn release(&mut self, cell_id: &str) -> bool {
        self.held.retain(|c| c != cell_id);
        self.manager.release(cell_id, &self.owner)
    }

    /// Keep this turn's locks alive.
    pub fn heartbeat(&self) -> usize {
        self.manager.heartbeat(&self.owner)
    }

    /// End the turn, returning how many locks were released.
    pub fn finish(mut self) -> usize {
        self.release_held()
    }

    fn release_held(&mut self) -> usize {
        let held = std::mem::take(&mut self.held);
        let released = held
            .iter()
            .filter(|cell_id| self.manager.release(cell_id, &self.owner))
            .count();
        if released > 0 {
            debug!(owner = %self.owner, released, "agent turn released locks");
        }
        released
    }
}

impl Drop for AgentTurn {
    fn drop(&mut self) {
        self.release_held();
    }
}
