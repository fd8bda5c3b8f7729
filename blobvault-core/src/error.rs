use crate::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("blob not found: {0}")]
    NotFound(Hash),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
