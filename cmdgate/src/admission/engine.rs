//! Admission Engine
//!
//! Combines entitlements, policies and counters into a single decision per command
//! invocation. The engine holds no mutable state of its own; clones share the same
//! collaborators and can be handed to as many tasks as needed.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::analytics::{AdmissionEvent, AnalyticsSink};
use super::clock::{Clock, SystemClock};
use super::counter::{CounterKey, UsageCounterStore};
use super::decision::Decision;
use super::entitlement::{EntitlementService, EntitlementStore};
use super::error::AdmissionError;
use super::policy::{normalize_command_name, PolicyStore, TierRule};
use super::report::{EventSummary, UsageReport};
use super::timeout::StorageTimeout;
use crate::metrics;

/// Admission engine
#[derive(Clone)]
pub struct AdmissionEngine {
    policies: Arc<PolicyStore>,
    entitlement_store: Arc<dyn EntitlementStore>,
    entitlements: EntitlementService,
    counters: Arc<dyn UsageCounterStore>,
    analytics: Arc<dyn AnalyticsSink>,
    clock: Arc<dyn Clock>,
    timeout: StorageTimeout,
}

impl AdmissionEngine {
    /// Create an engine from separate stores
    pub fn new(
        policies: PolicyStore,
        entitlement_store: Arc<dyn EntitlementStore>,
        counters: Arc<dyn UsageCounterStore>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let timeout = StorageTimeout::default();
        Self {
            policies: Arc::new(policies),
            entitlements: EntitlementService::new(entitlement_store.clone(), clock.clone(), timeout),
            entitlement_store,
            counters,
            analytics,
            clock,
            timeout,
        }
    }

    /// Create an engine backed by one store implementing every port
    pub fn with_store<S>(policies: PolicyStore, store: Arc<S>) -> Self
    where
        S: EntitlementStore + UsageCounterStore + AnalyticsSink + 'static,
    {
        Self::new(policies, store.clone(), store.clone(), store)
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild_entitlements();
        self
    }

    /// Replace the per-operation storage bound
    pub fn with_storage_timeout(mut self, timeout: StorageTimeout) -> Self {
        self.timeout = timeout;
        self.rebuild_entitlements();
        self
    }

    /// Replace the analytics sink
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    fn rebuild_entitlements(&mut self) {
        self.entitlements = EntitlementService::new(
            self.entitlement_store.clone(),
            self.clock.clone(),
            self.timeout,
        );
    }

    /// Loaded policies
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// Decide whether `user_id` may run `command_name` now.
    ///
    /// Only malformed input is returned as an error. Storage failures become a
    /// [`DecisionStatus::Error`](super::DecisionStatus::Error) decision.
    pub async fn evaluate(
        &self,
        user_id: &str,
        command_name: &str,
        group_context: Option<&str>,
    ) -> Result<Decision, AdmissionError> {
        let user_id = validate_user_id(user_id)?;
        let command = normalize_command_name(command_name);
        if command.is_empty() {
            return Err(AdmissionError::InvalidInput(
                "command name must not be empty".to_string(),
            ));
        }

        let timer = metrics::EVALUATE_DURATION_SECONDS.start_timer();
        let now = self.clock.now();
        let decision = self.decide(user_id, &command, now).await;
        timer.observe_duration();

        metrics::ADMISSION_DECISIONS_TOTAL
            .with_label_values(&[
                decision.status.as_str(),
                tier_label(decision.is_premium),
            ])
            .inc();
        debug!(
            user_id,
            command = %command,
            status = %decision.status,
            is_premium = decision.is_premium,
            count_before = ?decision.count_before_decision,
            limit = ?decision.limit_applied,
            "Admission decision"
        );

        self.record(&decision, user_id, &command, group_context, now)
            .await;

        Ok(decision)
    }

    async fn decide(&self, user_id: &str, command: &str, now: DateTime<Utc>) -> Decision {
        let is_premium = match self.entitlements.is_premium(user_id).await {
            Ok(is_premium) => is_premium,
            Err(e) => {
                metrics::STORAGE_ERRORS_TOTAL
                    .with_label_values(&["is_premium"])
                    .inc();
                error!(user_id, command, error = %e, "Entitlement lookup failed");
                return Decision::error(false);
            }
        };

        let resolved = self.policies.resolve(command);
        let Some(tier) = resolved.tier(is_premium) else {
            metrics::UNCONFIGURED_POLICY_TOTAL
                .with_label_values(&[tier_label(is_premium)])
                .inc();
            warn!(
                user_id,
                command,
                is_premium,
                "No policy configured for command, allowing unmetered"
            );
            return Decision::allowed(is_premium, -1, None);
        };

        match tier.rule() {
            TierRule::Unlimited => Decision::allowed(is_premium, -1, None),
            TierRule::Disabled => Decision::disabled(is_premium, command),
            TierRule::Bounded { limit, window } => {
                self.admit_bounded(user_id, command, is_premium, limit, window, now)
                    .await
            }
        }
    }

    async fn admit_bounded(
        &self,
        user_id: &str,
        command: &str,
        is_premium: bool,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Decision {
        let key = CounterKey::new(user_id, command);

        let outcome = match self
            .timeout
            .run(self.counters.start_or_increment(&key, window, limit, now))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::STORAGE_ERRORS_TOTAL
                    .with_label_values(&["start_or_increment"])
                    .inc();
                error!(user_id, command, error = %e, "Usage counter update failed");
                return Decision::error(is_premium);
            }
        };

        if outcome.window_was_reset {
            return Decision::allowed(is_premium, i64::from(limit), Some(0));
        }

        if !outcome.admitted {
            let remaining = match self
                .timeout
                .run(self.counters.peek_remaining_window(&key, window, now))
                .await
            {
                Ok(remaining) => Some(remaining),
                Err(e) => {
                    metrics::STORAGE_ERRORS_TOTAL
                        .with_label_values(&["peek_remaining_window"])
                        .inc();
                    warn!(user_id, command, error = %e, "Could not read remaining window");
                    None
                }
            };

            return Decision::rate_limited(
                is_premium,
                limit,
                outcome.prior_count,
                rate_limit_message(command, limit, window, remaining),
                remaining.map(ceil_secs),
            );
        }

        Decision::allowed(is_premium, i64::from(limit), Some(outcome.prior_count))
    }

    async fn record(
        &self,
        decision: &Decision,
        user_id: &str,
        command: &str,
        group_context: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let event = AdmissionEvent::from_decision(decision, user_id, command, group_context, now);
        if let Err(e) = self.timeout.run(self.analytics.record(&event)).await {
            metrics::ANALYTICS_DROPPED_TOTAL.inc();
            warn!(event_id = %event.id, error = %e, "Failed to record admission event");
        }
    }

    /// Grant premium to a user, optionally until `expires_at`
    pub async fn grant_premium(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AdmissionError> {
        let user_id = validate_user_id(user_id)?;
        self.entitlements.grant(user_id, expires_at).await?;
        debug!(user_id, expires_at = ?expires_at, "Granted premium");
        Ok(())
    }

    /// Revoke premium from a user
    pub async fn revoke_premium(&self, user_id: &str) -> Result<(), AdmissionError> {
        let user_id = validate_user_id(user_id)?;
        self.entitlements.revoke(user_id).await?;
        debug!(user_id, "Revoked premium");
        Ok(())
    }

    /// Current premium status and per-command window usage for a user
    pub async fn usage_report(&self, user_id: &str) -> Result<UsageReport, AdmissionError> {
        let user_id = validate_user_id(user_id)?;
        let is_premium = self.entitlements.is_premium(user_id).await?;
        let counters = self
            .timeout
            .run(self.counters.list_for_user(user_id))
            .await?;

        Ok(UsageReport::build(
            user_id,
            is_premium,
            &counters,
            &self.policies,
            self.clock.now(),
        ))
    }

    /// Most recent admission events, newest first, with a status breakdown
    pub async fn recent_events(
        &self,
        limit: usize,
    ) -> Result<(Vec<AdmissionEvent>, EventSummary), AdmissionError> {
        let events = self.timeout.run(self.analytics.recent(limit)).await?;
        let summary = EventSummary::from_events(&events);
        Ok((events, summary))
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("policies", &self.policies.len())
            .field("clock", &self.clock)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn validate_user_id(user_id: &str) -> Result<&str, AdmissionError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(AdmissionError::InvalidInput(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

fn tier_label(is_premium: bool) -> &'static str {
    if is_premium {
        "premium"
    } else {
        "standard"
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let millis = d.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

/// Human readable window length ("10 minutes", "1 hour", "2 days")
pub fn format_window(window: Duration) -> String {
    let minutes = window.num_minutes();
    let (amount, unit) = if minutes > 0 && minutes % (24 * 60) == 0 {
        (minutes / (24 * 60), "day")
    } else if minutes > 0 && minutes % 60 == 0 {
        (minutes / 60, "hour")
    } else {
        (minutes, "minute")
    };
    if amount == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

/// Message shown when a call is rate limited
pub fn rate_limit_message(
    command: &str,
    limit: u32,
    window: Duration,
    remaining: Option<Duration>,
) -> String {
    let used = format!(
        "You have used {} {} {} in the last {}.",
        command,
        limit,
        if limit == 1 { "time" } else { "times" },
        format_window(window)
    );
    match remaining {
        Some(remaining) => {
            let minutes = ceil_secs(remaining).div_ceil(60).max(1);
            format!(
                "{} Try again in {} {}.",
                used,
                minutes,
                if minutes == 1 { "minute" } else { "minutes" }
            )
        }
        None => format!("{} Please try again later.", used),
    }
}
