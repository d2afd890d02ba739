//! Admission Error Types
//!
//! Errors raised by the admission engine and its storage ports.

/// Errors raised by a durable store (entitlements, counters, analytics)
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached or opened
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the configured bound
    #[error("Storage operation timed out after {0}ms")]
    Timeout(u64),

    /// A query or statement failed
    #[error("Storage query failed: {0}")]
    Query(String),

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                ) =>
            {
                StorageError::Unavailable(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => StorageError::Corrupt(err.to_string()),
            other => StorageError::Query(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Unavailable(format!("storage worker failed: {}", err))
    }
}

/// Errors returned to callers of the admission engine
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Caller supplied an empty user id or command name
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Underlying store failed (only surfaced by administrative operations;
    /// `evaluate` converts these into an error decision)
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StorageError::from(err), StorageError::Unavailable(_)));
    }

    #[test]
    fn test_other_sqlite_errors_map_to_query() {
        let err = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(StorageError::from(err), StorageError::Query(_)));
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(
            StorageError::Timeout(250).to_string(),
            "Storage operation timed out after 250ms"
        );
    }

    #[test]
    fn test_admission_error_wraps_storage() {
        let err: AdmissionError = StorageError::Query("boom".into()).into();
        assert_eq!(err.to_string(), "Storage query failed: boom");
    }
}
