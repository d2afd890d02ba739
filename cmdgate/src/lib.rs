//! cmdgate
//!
//! Command admission control for chat bots: per-command tiered usage limits,
//! fixed usage windows per (user, command), and premium entitlements that expire
//! lazily on read.
//!
//! The [`admission`] module holds the engine and its ports, [`storage`] the
//! in-memory and SQLite backends.

pub mod admission;
pub mod config;
pub mod metrics;
pub mod metrics_server;
pub mod storage;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use admission::{AdmissionEngine, AnalyticsSink, AnalyticsWorker, BackgroundSink, NullSink};
use admission::{PolicyStore, StorageTimeout};
use config::Config;
use storage::SqliteStore;

/// Load the policy document named by `config`.
///
/// An explicitly configured file must exist. The default location is optional
/// and yields an empty policy set when absent.
pub fn load_policies(config: &Config) -> Result<PolicyStore> {
    let (path, explicit) = config.policies_path();
    if path.exists() {
        return PolicyStore::load_from_path(&path);
    }
    if explicit {
        anyhow::bail!("Policy file not found: {:?}", path);
    }
    warn!(
        "No policy file at {:?}; every command will be allowed without limits",
        path
    );
    Ok(PolicyStore::default())
}

/// Build an engine backed by the SQLite store named by `config`.
///
/// Returns the analytics worker when events are written in the background; the
/// caller should drop the engine and then join the worker to flush pending events.
pub fn build_engine(config: &Config) -> Result<(AdmissionEngine, Option<AnalyticsWorker>)> {
    let policies = load_policies(config)?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    let store = Arc::new(
        SqliteStore::open_with_busy_timeout(
            &db_path,
            std::time::Duration::from_millis(config.storage.busy_timeout_ms),
        )
        .with_context(|| format!("Failed to open database {:?}", db_path))?,
    );

    let (analytics, worker): (Arc<dyn AnalyticsSink>, Option<AnalyticsWorker>) =
        match (config.analytics.enabled, config.analytics.background) {
            (false, _) => (Arc::new(NullSink) as Arc<dyn AnalyticsSink>, None),
            (true, false) => (store.clone() as Arc<dyn AnalyticsSink>, None),
            (true, true) => {
                let (sink, worker) =
                    BackgroundSink::spawn(store.clone(), config.analytics.queue_capacity);
                (Arc::new(sink) as Arc<dyn AnalyticsSink>, Some(worker))
            }
        };

    let engine = AdmissionEngine::with_store(policies, store)
        .with_analytics(analytics)
        .with_storage_timeout(StorageTimeout::from_millis(config.storage.timeout_ms));

    info!(
        policies = engine.policies().len(),
        database = ?db_path,
        "Admission engine ready"
    );
    Ok((engine, worker))
}
