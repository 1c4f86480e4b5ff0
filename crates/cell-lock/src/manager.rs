use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{LockError, Result};
use crate::turn::AgentTurn;
use crate::types::{AcquireOutcome, CellLock, LockChange, LockOwner, OwnerKind, RevocationPolicy};

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Agent locks expire unless refreshed within this window.
    pub agent_ttl: Duration,
    /// Human locks expire after this long; `None` keeps them until release
    /// or disconnect.
    pub human_ttl: Option<Duration>,
    pub revocation: RevocationPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            agent_ttl: Duration::from_secs(120),
            human_ttl: None,
            revocation: RevocationPolicy::Never,
        }
    }
}

/// Lock table keyed by cell id.
///
/// Every operation touches only the entry for its cell (sharded map), so
/// unrelated cells never contend.
pub struct CellLockManager {
    locks: DashMap<String, CellLock>,
    config: LockConfig,
    changes: broadcast::Sender<LockChange>,
}

impl CellLockManager {
    pub fn new(config: LockConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            locks: DashMap::new(),
            config,
            changes,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Lock changes. For any one cell they arrive in the order they were
    /// applied, so the last change seen matches the table.
    pub fn subscribe(&self) -> broadcast::Receiver<LockChange> {
        self.changes.subscribe()
    }

    /// Grant the lock if the cell is free (or its lock expired). Re-acquiring
    /// your own lock succeeds and refreshes its expiry.
    pub fn try_acquire(&self, cell_id: &str, owner: &LockOwner) -> AcquireOutcome {
        self.acquire(cell_id, owner, false)
            .unwrap_or_else(|holder| AcquireOutcome::Denied { owner: holder })
    }

    /// Like [`try_acquire`](Self::try_acquire), but take a live lock from its
    /// holder when the configured [`RevocationPolicy`] allows it.
    pub fn force_acquire(&self, cell_id: &str, owner: &LockOwner) -> Result<AcquireOutcome> {
        if cell_id.is_empty() {
            return Err(LockError::InvalidRequest("empty cell id".into()));
        }
        self.acquire(cell_id, owner, true)
            .map_err(|holder| LockError::RevocationDenied { holder })
    }

    /// `Err` carries the current holder.
    fn acquire(
        &self,
        cell_id: &str,
        owner: &LockOwner,
        force: bool,
    ) -> std::result::Result<AcquireOutcome, LockOwner> {
        let now = Instant::now();
        let fresh = CellLock {
            cell_id: cell_id.to_string(),
            owner: owner.clone(),
            acquired_at: Utc::now(),
            expires_at: self.expiry(owner.kind, now),
        };

        // Changes are published while the entry is held, so subscribers see
        // them in the order they were applied to the cell.
        match self.locks.entry(cell_id.to_string()) {
            Entry::Vacant(entry) => {
                let _held = entry.insert(fresh);
                debug!(cell_id, owner = %owner, "lock granted");
                self.publish(cell_id, Some(owner.clone()));
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if current.owner == *owner {
                    current.expires_at = fresh.expires_at;
                    return Ok(AcquireOutcome::AlreadyHeld);
                }
                if !current.is_expired(now) {
                    let holder = current.owner.clone();
                    if !(force && self.config.revocation.allows(owner.kind, holder.kind)) {
                        return Err(holder);
                    }
                    info!(cell_id, from = %holder, to = %owner, "lock revoked");
                }
                entry.insert(fresh);
                debug!(cell_id, owner = %owner, "lock granted");
                self.publish(cell_id, Some(owner.clone()));
            }
        }
        Ok(AcquireOutcome::Granted)
    }

    /// Release a lock held by `owner`. Releasing a lock you don't hold is a
    /// no-op. Returns whether a lock was removed.
    pub fn release(&self, cell_id: &str, owner: &LockOwner) -> bool {
        match self.locks.entry(cell_id.to_string()) {
            Entry::Occupied(entry) if entry.get().owner == *owner => {
                debug!(cell_id, owner = %owner, "lock released");
                self.publish(cell_id, None);
                entry.remove_entry();
                true
            }
            _ => false,
        }
    }

    /// Release every lock `owner` holds, returning the freed cell ids.
    pub fn release_all_for(&self, owner: &LockOwner) -> Vec<String> {
        let mut released = Vec::new();
        for cell_id in self.cells_held_by(owner) {
            if self.release(&cell_id, owner) {
                released.push(cell_id);
            }
        }
        if !released.is_empty() {
            info!(owner = %owner, count = released.len(), "released all locks for owner");
        }
        released
    }

    /// Refresh the expiry of every lock `owner` holds. Returns how many.
    pub fn heartbeat(&self, owner: &LockOwner) -> usize {
        let expires_at = self.expiry(owner.kind, Instant::now());
        let mut refreshed = 0;
        for mut lock in self.locks.iter_mut() {
            if lock.owner == *owner {
                lock.expires_at = expires_at;
                refreshed += 1;
            }
        }
        refreshed
    }

    pub fn is_cell_locked(&self, cell_id: &str) -> bool {
        self.lock(cell_id).is_some()
    }

    pub fn get_cell_lock_owner(&self, cell_id: &str) -> Option<OwnerKind> {
        self.lock(cell_id).map(|lock| lock.owner.kind)
    }

    /// The live lock on `cell_id`, if any.
    pub fn lock(&self, cell_id: &str) -> Option<CellLock> {
        let now = Instant::now();
        self.locks
            .get(cell_id)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.value().clone())
    }

    pub fn cells_held_by(&self, owner: &LockOwner) -> Vec<String> {
        let now = Instant::now();
        self.locks
            .iter()
            .filter(|lock| lock.owner == *owner && !lock.is_expired(now))
            .map(|lock| lock.cell_id.clone())
            .collect()
    }

    /// Remove expired locks and announce them as unlocked.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|lock| lock.is_expired(now))
            .map(|lock| lock.cell_id.clone())
            .collect();

        let mut swept = Vec::new();
        for cell_id in expired {
            // Re-check: the cell may have been re-acquired since the scan.
            if let Entry::Occupied(entry) = self.locks.entry(cell_id.clone())
                && entry.get().is_expired(now)
            {
                info!(cell_id = %cell_id, owner = %entry.get().owner, "lock expired");
                self.publish(&cell_id, None);
                entry.remove_entry();
                swept.push(cell_id);
            }
        }
        swept
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_expired();
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Start an agent turn; its locks are released when the turn ends.
    pub fn begin_turn(self: &Arc<Self>, agent_id: impl Into<String>) -> AgentTurn {
        AgentTurn::new(Arc::clone(self), LockOwner::agent(agent_id))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn expiry(&self, kind: OwnerKind, now: Instant) -> Option<Instant> {
        match kind {
            OwnerKind::Agent => Some(now + self.config.agent_ttl),
            OwnerKind::Human => self.config.human_ttl.map(|ttl| now + ttl),
        }
    }

    fn publish(&self, cell_id: &str, owner: Option<LockOwner>) {
        // No subscribers is fine.
        let _ = self.changes.send(LockChange {
            cell_id: cell_id.to_string(),
            owner,
        });
    }
}
