//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for all cache operations.
///
/// Payloads are plain strings so the initialization outcome can be
/// memoized and handed to every caller that shares it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The operation was cancelled through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// The connection pool could not produce a live connection
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Creating or migrating the on-disk schema failed during the
    /// first initialization; the cache stays failed afterwards
    #[error("schema initialization failed: {0}")]
    SchemaFailure(String),

    /// Any other storage-layer failure; the unit of work was rolled back
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::OperationFailed(e.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_errors_map_to_operation_failed() {
        let err: CacheError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CacheError::OperationFailed(_)));
    }

    #[test]
    fn test_error_display_includes_detail() {
        let err = CacheError::StorageUnavailable("pool is shut down".to_string());
        assert!(err.to_string().contains("pool is shut down"));
    }
}
