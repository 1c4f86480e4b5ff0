use crate::types::LockOwner;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("cell is locked by {holder} and the revocation policy forbids taking it")]
    RevocationDenied { holder: LockOwner },

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, LockError>;
