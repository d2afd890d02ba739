//! SQLite store
//!
//! Durable implementation of the entitlement, counter and analytics ports. Several
//! engine processes may point at the same database file.
//!
//! ## Tables
//!
//! - `user_entitlements` - premium flag and expiry per user
//! - `usage_counters` - window state per (user, command)
//! - `admission_events` - append-only decision log
//!
//! Each operation opens its own connection on a blocking worker thread, so no
//! in-process lock serializes unrelated keys. Writers contend only on SQLite's own
//! write lock, waiting up to the configured busy timeout.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use crate::admission::analytics::{AdmissionEvent, AnalyticsSink};
use crate::admission::counter::{CounterKey, CounterOutcome, UsageCounter, UsageCounterStore};
use crate::admission::decision::DecisionStatus;
use crate::admission::entitlement::{EntitlementStore, UserEntitlement};
use crate::admission::error::StorageError;

/// Default wait for a competing writer to release the database
pub const DEFAULT_BUSY_TIMEOUT: StdDuration = StdDuration::from_millis(1500);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_entitlements (
    user_id             TEXT PRIMARY KEY NOT NULL,
    is_premium          INTEGER NOT NULL DEFAULT 0,
    premium_expires_at  INTEGER
);

CREATE TABLE IF NOT EXISTS usage_counters (
    user_id       TEXT NOT NULL,
    command_name  TEXT NOT NULL,
    count         INTEGER NOT NULL,
    window_start  INTEGER NOT NULL,
    last_used     INTEGER NOT NULL,
    PRIMARY KEY (user_id, command_name)
);

CREATE TABLE IF NOT EXISTS admission_events (
    seq                     INTEGER PRIMARY KEY AUTOINCREMENT,
    id                      TEXT NOT NULL UNIQUE,
    user_id                 TEXT NOT NULL,
    command_name            TEXT NOT NULL,
    group_context           TEXT,
    is_premium_at_decision  INTEGER NOT NULL,
    status                  TEXT NOT NULL,
    count_before_decision   INTEGER,
    limit_applied           INTEGER,
    recorded_at             INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_admission_events_user ON admission_events(user_id);
"#;

// Start a window when none exists or the stored one has elapsed, otherwise count the
// call only while it fits under the limit. When the DO UPDATE condition is false no
// row changes and RETURNING yields nothing, which is how a denial is detected.
const START_OR_INCREMENT: &str = r#"
INSERT INTO usage_counters (user_id, command_name, count, window_start, last_used)
VALUES (?1, ?2, 1, ?3, ?3)
ON CONFLICT (user_id, command_name) DO UPDATE SET
    count        = CASE WHEN ?3 - usage_counters.window_start > ?4 THEN 1
                        ELSE usage_counters.count + 1 END,
    window_start = CASE WHEN ?3 - usage_counters.window_start > ?4 THEN ?3
                        ELSE usage_counters.window_start END,
    last_used    = ?3
WHERE ?3 - usage_counters.window_start > ?4 OR usage_counters.count < ?5
RETURNING count
"#;

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: StdDuration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit busy timeout
    pub fn open_with_busy_timeout<P: AsRef<Path>>(
        path: P,
        busy_timeout: StdDuration,
    ) -> Result<Self, StorageError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        };
        info!("Opening SQLite admission store at {:?}", store.path);

        let conn = store.connect()?;
        // WAL lets readers proceed while a writer holds the lock; the mode is
        // persistent for the file.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// Database location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path).map_err(|e| {
            StorageError::Unavailable(format!("Failed to open {:?}: {}", self.path, e))
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    /// Run `f` with a fresh connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            f(&mut conn)
        })
        .await?
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::Corrupt(format!("invalid timestamp {}", millis)))
}

fn read_counter(conn: &Connection, key: &CounterKey) -> Result<Option<UsageCounter>, StorageError> {
    let row = conn
        .query_row(
            "SELECT count, window_start, last_used FROM usage_counters
             WHERE user_id = ?1 AND command_name = ?2",
            params![key.user_id, key.command_name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(count, window_start, last_used)| {
        Ok(UsageCounter {
            key: key.clone(),
            count: u32::try_from(count)
                .map_err(|_| StorageError::Corrupt(format!("negative count {}", count)))?,
            window_start: from_millis(window_start)?,
            last_used: from_millis(last_used)?,
        })
    })
    .transpose()
}

#[async_trait]
impl UsageCounterStore for SqliteStore {
    async fn start_or_increment(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome, StorageError> {
        let key = key.clone();
        let window_ms = window.num_milliseconds();
        let now_ms = to_millis(now);

        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front so the denial read below sees
            // the same state the upsert evaluated.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let written: Option<i64> = tx
                .query_row(
                    START_OR_INCREMENT,
                    params![key.user_id, key.command_name, now_ms, window_ms, i64::from(limit)],
                    |row| row.get(0),
                )
                .optional()?;

            let outcome = match written {
                Some(1) => CounterOutcome {
                    prior_count: 0,
                    window_was_reset: true,
                    admitted: true,
                },
                Some(count) => CounterOutcome {
                    prior_count: u32::try_from(count - 1)
                        .map_err(|_| StorageError::Corrupt(format!("count {}", count)))?,
                    window_was_reset: false,
                    admitted: true,
                },
                None => {
                    let current = read_counter(&tx, &key)?.ok_or_else(|| {
                        StorageError::Corrupt("counter vanished during upsert".to_string())
                    })?;
                    CounterOutcome {
                        prior_count: current.count,
                        window_was_reset: false,
                        admitted: false,
                    }
                }
            };

            tx.commit()?;
            debug!(
                user_id = %key.user_id,
                command = %key.command_name,
                prior = outcome.prior_count,
                admitted = outcome.admitted,
                reset = outcome.window_was_reset,
                "Counter upsert"
            );
            Ok(outcome)
        })
        .await
    }

    async fn peek_remaining_window(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Duration, StorageError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            Ok(read_counter(conn, &key)?
                .map(|counter| counter.remaining_window(window, now))
                .unwrap_or_else(Duration::zero))
        })
        .await
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StorageError> {
        let key = key.clone();
        self.with_conn(move |conn| read_counter(conn, &key)).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<UsageCounter>, StorageError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT command_name, count, window_start, last_used FROM usage_counters
                 WHERE user_id = ?1 ORDER BY command_name",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut counters = Vec::new();
            for row in rows {
                let (command_name, count, window_start, last_used) = row?;
                counters.push(UsageCounter {
                    key: CounterKey::new(&user_id, &command_name),
                    count: u32::try_from(count)
                        .map_err(|_| StorageError::Corrupt(format!("negative count {}", count)))?,
                    window_start: from_millis(window_start)?,
                    last_used: from_millis(last_used)?,
                });
            }
            Ok(counters)
        })
        .await
    }
}

#[async_trait]
impl EntitlementStore for SqliteStore {
    async fn fetch(&self, user_id: &str) -> Result<Option<UserEntitlement>, StorageError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT is_premium, premium_expires_at FROM user_entitlements
                     WHERE user_id = ?1",
                    params![user_id],
                    |row| Ok((row.get::<_, bool>(0)?, row.get::<_, Option<i64>>(1)?)),
                )
                .optional()?;

            row.map(|(is_premium, expires)| {
                Ok(UserEntitlement {
                    user_id: user_id.clone(),
                    is_premium,
                    premium_expires_at: expires.map(from_millis).transpose()?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn clear_if_expired(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let user_id = user_id.to_string();
        let now_ms = to_millis(now);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE user_entitlements
                 SET is_premium = 0, premium_expires_at = NULL
                 WHERE user_id = ?1
                   AND is_premium = 1
                   AND premium_expires_at IS NOT NULL
                   AND premium_expires_at <= ?2",
                params![user_id, now_ms],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn grant(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let user_id = user_id.to_string();
        let expires_ms = expires_at.map(to_millis);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_entitlements (user_id, is_premium, premium_expires_at)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT (user_id) DO UPDATE SET
                     is_premium = 1,
                     premium_expires_at = excluded.premium_expires_at",
                params![user_id, expires_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn revoke(&self, user_id: &str) -> Result<(), StorageError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE user_entitlements SET is_premium = 0, premium_expires_at = NULL
                 WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AnalyticsSink for SqliteStore {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StorageError> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO admission_events
                 (id, user_id, command_name, group_context, is_premium_at_decision,
                  status, count_before_decision, limit_applied, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id,
                    event.user_id,
                    event.command_name,
                    event.group_context,
                    event.is_premium_at_decision,
                    event.status.as_str(),
                    event.count_before_decision.map(i64::from),
                    event.limit_applied,
                    to_millis(event.timestamp),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AdmissionEvent>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, command_name, group_context, is_premium_at_decision,
                        status, count_before_decision, limit_applied, recorded_at
                 FROM admission_events ORDER BY seq DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, user_id, command_name, group_context, premium, status, count, limit, at) =
                    row?;
                events.push(AdmissionEvent {
                    status: DecisionStatus::parse(&status)
                        .ok_or_else(|| StorageError::Corrupt(format!("unknown status {}", status)))?,
                    id,
                    user_id,
                    command_name,
                    group_context,
                    is_premium_at_decision: premium,
                    count_before_decision: count.and_then(|c| u32::try_from(c).ok()),
                    limit_applied: limit,
                    timestamp: from_millis(at)?,
                });
            }
            Ok(events)
        })
        .await
    }
}
