use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Human,
    Agent,
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => f.write_str("human"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// An actor that can hold cell locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub kind: OwnerKind,
    pub id: String,
}

impl LockOwner {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::Human,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::Agent,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellLock {
    pub cell_id: String,
    pub owner: LockOwner,
    pub acquired_at: DateTime<Utc>,
    /// `None` means the lock lives until released.
    #[serde(skip)]
    pub expires_at: Option<Instant>,
}

impl CellLock {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Result of an acquire attempt. Denial is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// The requester already owned the lock; its expiry was refreshed.
    AlreadyHeld,
    Denied { owner: LockOwner },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted | Self::AlreadyHeld)
    }
}

/// Emitted whenever a cell changes hands. `owner: None` means unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockChange {
    pub cell_id: String,
    pub owner: Option<LockOwner>,
}

/// Whether one actor kind may take a live lock away from the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationPolicy {
    #[default]
    Never,
    HumanOverAgent,
    AgentOverHuman,
}

impl RevocationPolicy {
    pub fn allows(self, requester: OwnerKind, holder: OwnerKind) -> bool {
        match self {
            Self::Never => false,
            Self::HumanOverAgent => requester == OwnerKind::Human && holder == OwnerKind::Agent,
            Self::AgentOverHuman => requester == OwnerKind::Agent && holder == OwnerKind::Human,
        }
    }
}
