//! Usage Counters
//!
//! Per-(user, command) fixed-start windows. A counter starts on the first admitted
//! call, counts admitted calls until the window elapses, and restarts at one on the
//! first call after that. Denied calls never touch the counter.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// Composite key identifying a counter
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CounterKey {
    /// Stable chat identity
    pub user_id: String,

    /// Normalized command name
    pub command_name: String,
}

impl CounterKey {
    /// Create a new counter key
    pub fn new(user_id: &str, command_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            command_name: command_name.to_string(),
        }
    }
}

/// Stored counter state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub key: CounterKey,

    /// Admitted calls in the current window
    pub count: u32,

    /// When the current window began
    pub window_start: DateTime<Utc>,

    /// Time of the most recent admitted call
    pub last_used: DateTime<Utc>,
}

/// Result of [`UsageCounterStore::start_or_increment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOutcome {
    /// Count observed before this call (0 when a window was started)
    pub prior_count: u32,

    /// This call started a fresh window
    pub window_was_reset: bool,

    /// The call fit under the limit and was counted
    pub admitted: bool,
}

impl UsageCounter {
    /// Counter for a brand new window opened at `now`
    pub fn fresh(key: CounterKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            count: 1,
            window_start: now,
            last_used: now,
        }
    }

    /// Window has elapsed relative to `now`
    pub fn is_expired(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now - self.window_start > window
    }

    /// Time left in the current window, zero once it has elapsed
    pub fn remaining_window(&self, window: Duration, now: DateTime<Utc>) -> Duration {
        let remaining = match self.window_start.checked_add_signed(window) {
            Some(end) => end - now,
            None => return window,
        };
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    /// Apply one call to this counter in place.
    ///
    /// Callers must hold whatever exclusion the backing store uses for this key.
    pub fn advance(&mut self, window: Duration, limit: u32, now: DateTime<Utc>) -> CounterOutcome {
        if self.is_expired(window, now) {
            self.count = 1;
            self.window_start = now;
            self.last_used = now;
            return CounterOutcome {
                prior_count: 0,
                window_was_reset: true,
                admitted: true,
            };
        }

        let prior = self.count;
        if prior >= limit {
            return CounterOutcome {
                prior_count: prior,
                window_was_reset: false,
                admitted: false,
            };
        }

        self.count = prior + 1;
        self.last_used = now;
        CounterOutcome {
            prior_count: prior,
            window_was_reset: false,
            admitted: true,
        }
    }
}

/// Durable storage of usage counters
#[async_trait]
pub trait UsageCounterStore: Send + Sync {
    /// Atomically start a window or count one more call against `limit`.
    ///
    /// Concurrent calls on the same key are serialized by the store and observe
    /// distinct `prior_count` values. Calls on different keys must not block each
    /// other beyond what the store itself imposes.
    async fn start_or_increment(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome, StorageError>;

    /// Time until the current window for `key` expires. Never writes.
    async fn peek_remaining_window(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Duration, StorageError>;

    /// Read a counter without modifying it
    async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StorageError>;

    /// All counters belonging to a user
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<UsageCounter>, StorageError>;
}
