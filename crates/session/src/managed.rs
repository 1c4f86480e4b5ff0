use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sandbox::Sandbox;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::SessionInfo;

/// Registry key: one sandbox per (project, runtime version).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxKey {
    pub project_key: String,
    pub runtime_version: String,
}

impl SandboxKey {
    pub fn new(project_key: impl Into<String>, runtime_version: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            runtime_version: runtime_version.into(),
        }
    }
}

impl std::fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.project_key, self.runtime_version)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Provisioning = 0,
    Ready = 1,
    Busy = 2,
    Destroyed = 3,
}

impl SandboxState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 3, "invalid SandboxState: {v}");
        match v {
            0 => Self::Provisioning,
            1 => Self::Ready,
            2 => Self::Busy,
            _ => Self::Destroyed,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Ready => f.write_str("ready"),
            Self::Busy => f.write_str("busy"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

struct Usage {
    at: Instant,
    wall: DateTime<Utc>,
}

/// A backend sandbox plus the bookkeeping the registry and engine share.
pub struct ManagedSandbox {
    id: String,
    key: SandboxKey,
    created_at: DateTime<Utc>,
    last_used: Mutex<Usage>,
    state: AtomicU8,
    installed: Mutex<BTreeSet<String>>,
    /// Exclusive-per-call gate. Executions and installs queue on it in FIFO
    /// order (tokio's mutex is fair).
    pub(crate) gate: Arc<tokio::sync::Mutex<()>>,
    pub(crate) inner: Box<dyn Sandbox>,
}

impl ManagedSandbox {
    pub(crate) fn new(key: SandboxKey, inner: Box<dyn Sandbox>) -> Self {
        Self {
            id: inner.id().to_string(),
            key,
            created_at: Utc::now(),
            last_used: Mutex::new(Usage {
                at: Instant::now(),
                wall: Utc::now(),
            }),
            state: AtomicU8::new(SandboxState::Provisioning as u8),
            installed: Mutex::new(BTreeSet::new()),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            inner,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &SandboxKey {
        &self.key
    }

    pub fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ready or Busy: the registry may hand it out.
    pub fn is_live(&self) -> bool {
        matches!(self.state(), SandboxState::Ready | SandboxState::Busy)
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    pub(crate) fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Destroyed from any state. Returns `true` only for the call that
    /// performed the transition.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state.swap(SandboxState::Destroyed as u8, Ordering::AcqRel)
            != SandboxState::Destroyed as u8
    }

    pub(crate) fn touch(&self) {
        let mut usage = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        usage.at = Instant::now();
        usage.wall = Utc::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .at
            .elapsed()
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub(crate) fn add_package(&self, name: String) {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name);
    }

    pub fn info(&self) -> SessionInfo {
        let (last_used_at, idle) = {
            let usage = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
            (usage.wall, usage.at.elapsed())
        };
        SessionInfo {
            id: self.id.clone(),
            project_key: self.key.project_key.clone(),
            runtime_version: self.key.runtime_version.clone(),
            state: self.state(),
            installed_packages: self
                .installed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            created_at: self.created_at,
            last_used_at,
            idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl std::fmt::Debug for ManagedSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSandbox")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
