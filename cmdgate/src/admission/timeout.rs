//! Storage Timeout Management
//!
//! Every round-trip to a store is bounded; an elapsed bound is reported as
//! [`StorageError::Timeout`] so the engine can treat it like any other outage.

use std::future::Future;
use std::time::Duration;
use tokio::time;

use super::error::StorageError;

/// Default bound for a single storage operation
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Timeout applied to storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageTimeout {
    duration: Duration,
}

impl Default for StorageTimeout {
    fn default() -> Self {
        Self::new(DEFAULT_STORAGE_TIMEOUT)
    }
}

impl StorageTimeout {
    /// Create a new storage timeout
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Create a timeout from milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Get the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run a storage future under this bound
    pub async fn run<F, T>(&self, future: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.duration.as_millis() as u64)),
        }
    }
}
