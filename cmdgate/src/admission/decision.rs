//! Admission decisions returned to the message dispatcher.

use serde::{Deserialize, Serialize};

/// User-facing text for decisions that failed on storage
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong, please try again later.";

/// Verdict for one command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Allowed,
    RateLimited,
    Disabled,
    Error,
}

impl DecisionStatus {
    /// Stable lowercase name (metrics labels, storage)
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Allowed => "allowed",
            DecisionStatus::RateLimited => "rate_limited",
            DecisionStatus::Disabled => "disabled",
            DecisionStatus::Error => "error",
        }
    }

    /// Parse the name produced by [`DecisionStatus::as_str`]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allowed" => Some(DecisionStatus::Allowed),
            "rate_limited" => Some(DecisionStatus::RateLimited),
            "disabled" => Some(DecisionStatus::Disabled),
            "error" => Some(DecisionStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`AdmissionEngine::evaluate`](super::AdmissionEngine::evaluate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub status: DecisionStatus,

    /// Text to show the user when the command is not executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Tier used for the decision
    pub is_premium: bool,

    /// Limit that was applied (-1 for unlimited or unconfigured)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_applied: Option<i64>,

    /// Admitted calls in the window before this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_before_decision: Option<u32>,

    /// Seconds until the window frees up (rate limited only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Command may run
    pub fn allowed(is_premium: bool, limit_applied: i64, count_before: Option<u32>) -> Self {
        Self {
            status: DecisionStatus::Allowed,
            message: None,
            is_premium,
            limit_applied: Some(limit_applied),
            count_before_decision: count_before,
            retry_after_secs: None,
        }
    }

    /// Command is switched off for this tier
    pub fn disabled(is_premium: bool, command_name: &str) -> Self {
        Self {
            status: DecisionStatus::Disabled,
            message: Some(format!("{} disabled", command_name)),
            is_premium,
            limit_applied: Some(0),
            count_before_decision: None,
            retry_after_secs: None,
        }
    }

    /// Window limit reached
    pub fn rate_limited(
        is_premium: bool,
        limit: u32,
        count_before: u32,
        message: String,
        retry_after_secs: Option<u64>,
    ) -> Self {
        Self {
            status: DecisionStatus::RateLimited,
            message: Some(message),
            is_premium,
            limit_applied: Some(i64::from(limit)),
            count_before_decision: Some(count_before),
            retry_after_secs,
        }
    }

    /// Storage failed; the user only sees a generic message
    pub fn error(is_premium: bool) -> Self {
        Self {
            status: DecisionStatus::Error,
            message: Some(GENERIC_ERROR_MESSAGE.to_string()),
            is_premium,
            limit_applied: None,
            count_before_decision: None,
            retry_after_secs: None,
        }
    }

    /// Convenience for dispatchers
    pub fn is_allowed(&self) -> bool {
        self.status == DecisionStatus::Allowed
    }
}
