//! In-memory store
//!
//! Implements every storage port for tests and single-process embedding. Counters
//! and entitlements live in sharded maps so that updates to one key only lock the
//! shard holding it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::admission::analytics::{AdmissionEvent, AnalyticsSink};
use crate::admission::counter::{CounterKey, CounterOutcome, UsageCounter, UsageCounterStore};
use crate::admission::entitlement::{EntitlementStore, UserEntitlement};
use crate::admission::error::StorageError;

/// Events kept before the oldest are discarded
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// In-memory implementation of the entitlement, counter and analytics ports
#[derive(Debug, Clone)]
pub struct MemoryStore {
    counters: Arc<DashMap<CounterKey, UsageCounter>>,
    entitlements: Arc<DashMap<String, UserEntitlement>>,
    events: Arc<RwLock<VecDeque<AdmissionEvent>>>,
    event_capacity: usize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty store retaining at most `capacity` events
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            entitlements: Arc::new(DashMap::new()),
            events: Arc::new(RwLock::new(VecDeque::new())),
            event_capacity: capacity.max(1),
        }
    }

    /// Number of stored counters
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of retained events
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageCounterStore for MemoryStore {
    async fn start_or_increment(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome, StorageError> {
        // The entry guard holds the shard lock for this key until it is dropped.
        match self.counters.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(UsageCounter::fresh(key.clone(), now));
                Ok(CounterOutcome {
                    prior_count: 0,
                    window_was_reset: true,
                    admitted: true,
                })
            }
            Entry::Occupied(mut occupied) => Ok(occupied.get_mut().advance(window, limit, now)),
        }
    }

    async fn peek_remaining_window(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Duration, StorageError> {
        Ok(self
            .counters
            .get(key)
            .map(|counter| counter.remaining_window(window, now))
            .unwrap_or_else(Duration::zero))
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StorageError> {
        Ok(self.counters.get(key).map(|c| c.value().clone()))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<UsageCounter>, StorageError> {
        Ok(self
            .counters
            .iter()
            .filter(|c| c.key().user_id == user_id)
            .map(|c| c.value().clone())
            .collect())
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn fetch(&self, user_id: &str) -> Result<Option<UserEntitlement>, StorageError> {
        Ok(self.entitlements.get(user_id).map(|e| e.value().clone()))
    }

    async fn clear_if_expired(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        match self.entitlements.get_mut(user_id) {
            Some(mut record) if record.is_stale(now) => {
                record.is_premium = false;
                record.premium_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn grant(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        self.entitlements.insert(
            user_id.to_string(),
            UserEntitlement {
                user_id: user_id.to_string(),
                is_premium: true,
                premium_expires_at: expires_at,
            },
        );
        Ok(())
    }

    async fn revoke(&self, user_id: &str) -> Result<(), StorageError> {
        if let Some(mut record) = self.entitlements.get_mut(user_id) {
            record.is_premium = false;
            record.premium_expires_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for MemoryStore {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StorageError> {
        let mut events = self.events.write().await;
        events.push_back(event.clone());
        while events.len() > self.event_capacity {
            events.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AdmissionEvent>, StorageError> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
