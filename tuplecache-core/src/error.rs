//! Error types for tuplecache operations

use thiserror::Error;

/// Storage layer errors.
///
/// Errors are `Clone` because a single backend failure may be recorded once
/// and then handed to every reader sharing the same result stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The iterator has no more items. Not a failure.
    #[error("iterator done")]
    IteratorDone,

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("Store not found: {store_id}")]
    StoreNotFound { store_id: String },

    #[error("Tuple not found")]
    NotFound,

    #[error("Invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("Invalid continuation token: {token}")]
    InvalidContinuationToken { token: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },
}

impl StorageError {
    /// Build a `QueryFailed` error from anything displayable.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Returns true for the end-of-stream marker.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::IteratorDone)
    }

    /// Returns true if the error comes from the caller's context rather than
    /// the backend.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all tuplecache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TupleCacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for backend and iterator operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for tuplecache operations.
pub type TupleCacheResult<T> = Result<T, TupleCacheError>;

// =============================================================================
// TESTS
// =============================================================================
