//! Admission Analytics
//!
//! One append-only event per evaluation. Recording is best-effort: a sink failure is
//! logged and counted, never turned into a different decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::decision::{Decision, DecisionStatus};
use super::error::StorageError;
use crate::metrics;

/// Recorded admission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionEvent {
    /// Unique event id
    pub id: String,

    pub user_id: String,
    pub command_name: String,

    /// Group chat the command was sent in, if any
    pub group_context: Option<String>,

    pub is_premium_at_decision: bool,
    pub status: DecisionStatus,
    pub count_before_decision: Option<u32>,
    pub limit_applied: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl AdmissionEvent {
    /// Build an event from a decision and its request context
    pub fn from_decision(
        decision: &Decision,
        user_id: &str,
        command_name: &str,
        group_context: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("adm-{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            command_name: command_name.to_string(),
            group_context: group_context.map(str::to_string),
            is_premium_at_decision: decision.is_premium,
            status: decision.status,
            count_before_decision: decision.count_before_decision,
            limit_applied: decision.limit_applied,
            timestamp,
        }
    }
}

/// Destination for admission events
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Append one event
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StorageError>;

    /// Most recent events, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<AdmissionEvent>, StorageError>;
}

/// Sink that discards everything (analytics disabled)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl AnalyticsSink for NullSink {
    async fn record(&self, _event: &AdmissionEvent) -> Result<(), StorageError> {
        Ok(())
    }

    async fn recent(&self, _limit: usize) -> Result<Vec<AdmissionEvent>, StorageError> {
        Ok(Vec::new())
    }
}

/// Sink that hands events to a background task through a bounded queue.
///
/// `record` never waits on the inner sink. A full queue rejects the event.
#[derive(Clone)]
pub struct BackgroundSink {
    sender: mpsc::Sender<AdmissionEvent>,
    inner: Arc<dyn AnalyticsSink>,
}

/// Handle to the task draining a [`BackgroundSink`]
#[derive(Debug)]
pub struct AnalyticsWorker {
    handle: JoinHandle<usize>,
}

impl AnalyticsWorker {
    /// Wait until every queued event is written. Completes once all
    /// `BackgroundSink` clones have been dropped. Returns the number written.
    pub async fn join(self) -> usize {
        match self.handle.await {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "Analytics worker terminated abnormally");
                0
            }
        }
    }
}

impl BackgroundSink {
    /// Start the background task. Must be called inside a tokio runtime.
    pub fn spawn(inner: Arc<dyn AnalyticsSink>, capacity: usize) -> (Self, AnalyticsWorker) {
        let (sender, mut receiver) = mpsc::channel::<AdmissionEvent>(capacity.max(1));
        let writer = inner.clone();

        let handle = tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(event) = receiver.recv().await {
                match writer.record(&event).await {
                    Ok(()) => written += 1,
                    Err(e) => {
                        metrics::ANALYTICS_DROPPED_TOTAL.inc();
                        warn!(event_id = %event.id, error = %e, "Failed to persist admission event");
                    }
                }
            }
            debug!(written, "Analytics worker drained");
            written
        });

        (Self { sender, inner }, AnalyticsWorker { handle })
    }
}

#[async_trait]
impl AnalyticsSink for BackgroundSink {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StorageError> {
        self.sender.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StorageError::Unavailable("analytics queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                StorageError::Unavailable("analytics worker stopped".to_string())
            }
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AdmissionEvent>, StorageError> {
        self.inner.recent(limit).await
    }
}

impl std::fmt::Debug for BackgroundSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSink")
            .field("capacity", &self.sender.max_capacity())
            .finish_non_exhaustive()
    }
}
