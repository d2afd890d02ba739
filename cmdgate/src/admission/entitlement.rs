//! Premium Entitlements
//!
//! Premium membership is a flag with an optional expiry. Expired flags are not swept
//! in the background; the first read that notices one clears it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::clock::Clock;
use super::error::StorageError;
use super::timeout::StorageTimeout;
use crate::metrics;

/// Stored entitlement for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub user_id: String,
    pub is_premium: bool,
    pub premium_expires_at: Option<DateTime<Utc>>,
}

impl UserEntitlement {
    /// Flag is set but its expiry has passed
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && matches!(self.premium_expires_at, Some(expires) if expires <= now)
    }

    /// Premium right now
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && self.premium_expires_at.map_or(true, |expires| expires > now)
    }
}

/// Durable storage of user entitlements
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Point lookup by user id
    async fn fetch(&self, user_id: &str) -> Result<Option<UserEntitlement>, StorageError>;

    /// Clear the premium flag and expiry, but only if the stored record is still
    /// premium with an expiry at or before `now`. Returns whether a row changed.
    ///
    /// The condition keeps a concurrent re-grant from being overwritten.
    async fn clear_if_expired(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Grant premium, creating the record if needed
    async fn grant(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Remove premium immediately
    async fn revoke(&self, user_id: &str) -> Result<(), StorageError>;
}

/// Answers "is this user premium right now?"
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    timeout: StorageTimeout,
}

impl EntitlementService {
    /// Create a new entitlement service
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
        timeout: StorageTimeout,
    ) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Whether `user_id` currently holds premium.
    ///
    /// A stale record is normalized on the way out; the answer is `false` whether or
    /// not that cleanup write succeeds.
    pub async fn is_premium(&self, user_id: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let record = self.timeout.run(self.store.fetch(user_id)).await?;

        let Some(record) = record else {
            return Ok(false);
        };

        if record.is_stale(now) {
            match self
                .timeout
                .run(self.store.clear_if_expired(user_id, now))
                .await
            {
                Ok(true) => {
                    metrics::ENTITLEMENT_NORMALIZATIONS_TOTAL.inc();
                    debug!(user_id, "Cleared expired premium entitlement");
                }
                Ok(false) => {
                    debug!(user_id, "Expired entitlement already normalized or re-granted");
                }
                Err(e) => {
                    metrics::STORAGE_ERRORS_TOTAL
                        .with_label_values(&["clear_entitlement"])
                        .inc();
                    warn!(user_id, error = %e, "Failed to clear expired premium entitlement");
                }
            }
            return Ok(false);
        }

        Ok(record.is_active(now))
    }

    /// Grant premium to a user
    pub async fn grant(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.timeout.run(self.store.grant(user_id, expires_at)).await
    }

    /// Revoke premium from a user
    pub async fn revoke(&self, user_id: &str) -> Result<(), StorageError> {
        self.timeout.run(self.store.revoke(user_id)).await
    }
}

impl std::fmt::Debug for EntitlementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementService")
            .field("clock", &self.clock)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::clock::MockClock;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn service(store: Arc<MemoryStore>) -> EntitlementService {
        EntitlementService::new(
            store,
            Arc::new(MockClock::new(now())),
            StorageTimeout::default(),
        )
    }

    #[test]
    fn test_staleness_rules() {
        let record = UserEntitlement {
            user_id: "u".into(),
            is_premium: true,
            premium_expires_at: Some(now() - Duration::minutes(5)),
        };
        assert!(record.is_stale(now()));
        assert!(!record.is_active(now()));

        let open_ended = UserEntitlement {
            premium_expires_at: None,
            ..record.clone()
        };
        assert!(!open_ended.is_stale(now()));
        assert!(open_ended.is_active(now()));
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_premium() {
        let store = Arc::new(MemoryStore::new());
        assert!(!service(store).is_premium("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_active_grant() {
        let store = Arc::new(MemoryStore::new());
        store
            .grant("alice", Some(now() + Duration::days(30)))
            .await
            .unwrap();
        assert!(service(store).is_premium("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_grant_is_normalized() {
        let store = Arc::new(MemoryStore::new());
        store
            .grant("bob", Some(now() - Duration::minutes(5)))
            .await
            .unwrap();

        assert!(!service(store.clone()).is_premium("bob").await.unwrap());

        let record = store.fetch("bob").await.unwrap().unwrap();
        assert!(!record.is_premium);
        assert_eq!(record.premium_expires_at, None);
    }

    #[tokio::test]
    async fn test_revoke() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store);
        service.grant("carol", None).await.unwrap();
        assert!(service.is_premium("carol").await.unwrap());
        service.revoke("carol").await.unwrap();
        assert!(!service.is_premium("carol").await.unwrap());
    }
}
