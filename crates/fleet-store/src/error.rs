//! Error types for the fleet store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Exists,
    Unreachable,
    Unknown,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    Exists(String),

    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// A watch asked for history that is gone; the consumer must resync.
    #[error("required revision has been compacted (compacted at {0})")]
    Compacted(i64),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("store error: {0}")]
    Unknown(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Exists(_) => ErrorKind::Exists,
            StoreError::Unreachable(_) => ErrorKind::Unreachable,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
