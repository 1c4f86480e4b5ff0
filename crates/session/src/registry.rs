use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sandbox::{ResourceLimits, SandboxConfig, SandboxFactory};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::managed::{ManagedSandbox, SandboxKey, SandboxState};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub idle_ttl: Duration,
    /// Delay before the single internal provisioning retry.
    pub provision_backoff: Duration,
    pub limits: ResourceLimits,
}

/// Per-key creation guard. Holding the mutex means "I am the one provisioning
/// (or checking) this key"; everyone else waits on it.
type Slot = Arc<Mutex<Option<Arc<ManagedSandbox>>>>;

/// Owns sandbox lifecycle keyed by (project, runtime version).
///
/// Share via `Arc<SandboxRegistry>`. Keys never serialize against each other:
/// each key has its own guard, and lookups go through sharded maps.
pub struct SandboxRegistry {
    factory: Arc<dyn SandboxFactory>,
    config: RegistryConfig,
    slots: DashMap<SandboxKey, Slot>,
    by_id: DashMap<String, Arc<ManagedSandbox>>,
}

impl SandboxRegistry {
    pub fn new(factory: Arc<dyn SandboxFactory>, config: RegistryConfig) -> Self {
        Self {
            factory,
            config,
            slots: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Return the live sandbox for the key, provisioning one if needed.
    ///
    /// Concurrent callers for an unprovisioned key wait for the single
    /// in-flight creation instead of creating duplicates.
    pub async fn acquire(
        &self,
        project_key: &str,
        runtime_version: &str,
    ) -> Result<Arc<ManagedSandbox>> {
        let key = SandboxKey::new(project_key, runtime_version);
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_ref() {
            if existing.is_live() {
                existing.touch();
                return Ok(Arc::clone(existing));
            }
            debug!(key = %key, id = existing.id(), "dropping destroyed sandbox from slot");
            *guard = None;
        }

        let sandbox = Arc::new(self.provision_with_retry(&key).await?);
        self.by_id
            .insert(sandbox.id().to_string(), Arc::clone(&sandbox));
        *guard = Some(Arc::clone(&sandbox));
        Ok(sandbox)
    }

    /// Look up a live sandbox by id.
    pub fn get(&self, id: &str) -> Option<Arc<ManagedSandbox>> {
        self.by_id
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|sandbox| sandbox.is_live())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Destroy a sandbox so it is never handed out again. Idempotent: returns
    /// `true` only for the call that actually tore it down.
    pub async fn evict(&self, sandbox: &Arc<ManagedSandbox>) -> bool {
        if !sandbox.mark_destroyed() {
            return false;
        }
        self.release(sandbox).await;
        true
    }

    /// Evict by id. Unknown ids are a no-op.
    pub async fn teardown(&self, id: &str) -> bool {
        let Some(sandbox) = self.by_id.get(id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        self.evict(&sandbox).await
    }

    /// Destroy every Ready sandbox idle for at least the configured TTL.
    /// Busy sandboxes are never swept. Returns how many were destroyed.
    pub async fn sweep_idle(&self) -> usize {
        let candidates: Vec<Arc<ManagedSandbox>> = self
            .by_id
            .iter()
            .filter(|e| e.value().idle_for() >= self.config.idle_ttl)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut swept = 0;
        for sandbox in candidates {
            // CAS races with the engine's Ready -> Busy; exactly one side wins.
            if sandbox.transition(SandboxState::Ready, SandboxState::Destroyed) {
                info!(id = sandbox.id(), key = %sandbox.key(), "sweeping idle sandbox");
                self.release(&sandbox).await;
                swept += 1;
            }
        }
        swept
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = registry.sweep_idle().await;
                        if swept > 0 {
                            debug!(swept, "idle sweep finished");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Destroy every sandbox.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<ManagedSandbox>> =
            self.by_id.iter().map(|e| Arc::clone(e.value())).collect();
        for sandbox in &all {
            self.evict(sandbox).await;
        }
        self.slots.clear();
        info!(count = all.len(), "registry shut down");
    }

    /// Second half of destruction, after the state moved to Destroyed.
    async fn release(&self, sandbox: &Arc<ManagedSandbox>) {
        self.by_id.remove(sandbox.id());

        // Skip when an acquire holds the slot; it drops destroyed entries itself.
        let slot = self
            .slots
            .get(sandbox.key())
            .map(|entry| Arc::clone(entry.value()));
        if let Some(slot) = slot
            && let Ok(mut guard) = slot.try_lock()
            && guard.as_ref().is_some_and(|s| s.id() == sandbox.id())
        {
            *guard = None;
        }

        self.factory.destroy(sandbox.inner.as_ref()).await;
    }

    async fn provision_with_retry(&self, key: &SandboxKey) -> Result<ManagedSandbox> {
        match self.provision(key).await {
            Ok(sandbox) => Ok(sandbox),
            Err(first) => {
                warn!(key = %key, error = %first, "provisioning failed, retrying once");
                tokio::time::sleep(self.config.provision_backoff).await;
                self.provision(key).await.map_err(|e| {
                    error!(key = %key, error = %e, "provisioning failed after retry");
                    SessionError::SandboxUnavailable(format!("provision {key}: {e}"))
                })
            }
        }
    }

    async fn provision(&self, key: &SandboxKey) -> sandbox::Result<ManagedSandbox> {
        let config = SandboxConfig {
            id: Uuid::new_v4(),
            project_key: key.project_key.clone(),
            runtime_version: key.runtime_version.clone(),
            resources: self.config.limits,
        };
        info!(key = %key, sandbox_id = %config.id, factory = self.factory.name(), "provisioning sandbox");

        let mut inner = self.factory.create(config).await?;
        if let Err(e) = inner.start().await {
            self.factory.destroy(inner.as_ref()).await;
            return Err(e);
        }

        let sandbox = ManagedSandbox::new(key.clone(), inner);
        sandbox.transition(SandboxState::Provisioning, SandboxState::Ready);
        Ok(sandbox)
    }
}
