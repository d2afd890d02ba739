//! Usage Reports
//!
//! Read-only views over counters and admission events for operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analytics::AdmissionEvent;
use super::counter::UsageCounter;
use super::decision::DecisionStatus;
use super::policy::{PolicyStore, TierRule};

/// Premium status and window usage for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub user_id: String,
    pub is_premium: bool,
    pub generated_at: DateTime<Utc>,
    pub commands: Vec<CommandUsage>,
}

/// Usage of a single command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandUsage {
    pub command_name: String,

    /// Stored count (stale once `window_active` is false)
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub last_used: DateTime<Utc>,

    /// Limit the user's current tier would apply (-1 unlimited, None unconfigured)
    pub limit_applied: Option<i64>,

    /// Seconds left in the current window
    pub window_remaining_secs: u64,

    /// The stored window still applies
    pub window_active: bool,
}

impl UsageReport {
    /// Assemble a report from a user's counters and the loaded policies
    pub fn build(
        user_id: &str,
        is_premium: bool,
        counters: &[UsageCounter],
        policies: &PolicyStore,
        now: DateTime<Utc>,
    ) -> Self {
        let mut commands: Vec<CommandUsage> = counters
            .iter()
            .map(|counter| {
                let tier = policies
                    .resolve(&counter.key.command_name)
                    .tier(is_premium)
                    .copied();

                let (limit_applied, remaining, active) = match tier.map(|t| t.rule()) {
                    Some(TierRule::Bounded { limit, window }) => {
                        let remaining = counter.remaining_window(window, now);
                        (
                            Some(i64::from(limit)),
                            remaining.num_seconds().max(0) as u64,
                            !counter.is_expired(window, now),
                        )
                    }
                    Some(TierRule::Unlimited) => (Some(-1), 0, false),
                    Some(TierRule::Disabled) => (Some(0), 0, false),
                    None => (None, 0, false),
                };

                CommandUsage {
                    command_name: counter.key.command_name.clone(),
                    count: counter.count,
                    window_start: counter.window_start,
                    last_used: counter.last_used,
                    limit_applied,
                    window_remaining_secs: remaining,
                    window_active: active,
                }
            })
            .collect();
        commands.sort_by(|a, b| a.command_name.cmp(&b.command_name));

        Self {
            user_id: user_id.to_string(),
            is_premium,
            generated_at: now,
            commands,
        }
    }
}

/// Status breakdown over a set of events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub total: usize,
    pub allowed: usize,
    pub rate_limited: usize,
    pub disabled: usize,
    pub error: usize,
    pub premium: usize,
}

impl EventSummary {
    /// Count events by status
    pub fn from_events(events: &[AdmissionEvent]) -> Self {
        let mut summary = Self {
            total: events.len(),
            ..Self::default()
        };
        for event in events {
            match event.status {
                DecisionStatus::Allowed => summary.allowed += 1,
                DecisionStatus::RateLimited => summary.rate_limited += 1,
                DecisionStatus::Disabled => summary.disabled += 1,
                DecisionStatus::Error => summary.error += 1,
            }
            if event.is_premium_at_decision {
                summary.premium += 1;
            }
        }
        summary
    }
}
