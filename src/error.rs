use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`BackingStore`](crate::traits::BackingStore) implementation.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The store cannot be reached or refused the operation.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// The store, or a value in it, can no longer be read back.
    #[error("backing store corrupted: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// A record failed field validation and never reached the cache.
    #[error("invalid record: {0}")]
    Validation(String),

    /// The operation exceeded its wall-clock budget. Work already persisted stays persisted.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    /// A single key could not be written or read. Batch operations log these and carry on.
    #[error("failed to persist '{key}': {source}")]
    Persistence {
        key:    String,
        #[source]
        source: BackendError,
    },

    /// An exclusive operation is already running on this instance.
    #[error("{0} is already in progress")]
    ConcurrencyGuard(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_guard(&self) -> bool {
        matches!(self, Self::ConcurrencyGuard(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
