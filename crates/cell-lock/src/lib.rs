//! Cell lock manager: at most one live owner per notebook cell, shared
//! between human editors and agent turns.

mod error;
mod manager;
mod turn;
mod types;

pub use error::{LockError, Result};
pub use manager::{CellLockManager, LockConfig};
pub use turn::AgentTurn;
pub use types::{AcquireOutcome, CellLock, LockChange, LockOwner, OwnerKind, RevocationPolicy};
