//! Command Policies
//!
//! Per-command tiered limits, loaded once at startup from a policy document and
//! resolved with a pure lookup on every evaluation.
//!
//! A policy document is a map keyed by command name. The `default` key applies to
//! every command without its own entry:
//!
//! ```json
//! {
//!   "default": {
//!     "premium":    { "limit": -1 },
//!     "nonPremium": { "limit": 20, "windowMinutes": 60 }
//!   },
//!   "imagine": {
//!     "premium":    { "limit": 30, "windowMinutes": 60 },
//!     "nonPremium": { "limit": 0 }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Key of the fallback entry in a policy document
pub const DEFAULT_POLICY_KEY: &str = "default";

/// Longest accepted window (366 days)
pub const MAX_WINDOW_MINUTES: i64 = 366 * 24 * 60;

/// Limit and window for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimit {
    /// Negative: unlimited. Zero: disabled. Positive: calls per window.
    pub limit: i64,

    /// Window length in minutes (only meaningful when `limit > 0`)
    #[serde(default)]
    pub window_minutes: i64,
}

/// How a tier limit is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierRule {
    /// No counter is kept
    Unlimited,
    /// Command is switched off for the tier
    Disabled,
    /// At most `limit` admitted calls per `window`
    Bounded { limit: u32, window: Duration },
}

impl TierLimit {
    /// Create a tier limit
    pub fn new(limit: i64, window_minutes: i64) -> Self {
        Self {
            limit,
            window_minutes,
        }
    }

    /// Unlimited tier
    pub fn unlimited() -> Self {
        Self::new(-1, 0)
    }

    /// Disabled tier
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Classify this limit. Windows outside `0..=MAX_WINDOW_MINUTES` are clamped.
    pub fn rule(&self) -> TierRule {
        match self.limit {
            l if l < 0 => TierRule::Unlimited,
            0 => TierRule::Disabled,
            l => TierRule::Bounded {
                limit: u32::try_from(l).unwrap_or(u32::MAX),
                window: Duration::minutes(self.window_minutes.clamp(0, MAX_WINDOW_MINUTES)),
            },
        }
    }

    fn validate(&self, command: &str, tier: &str) -> Result<()> {
        if self.window_minutes < 0 {
            anyhow::bail!(
                "Policy '{}' ({}) has negative windowMinutes: {}",
                command,
                tier,
                self.window_minutes
            );
        }
        if self.window_minutes > MAX_WINDOW_MINUTES
            || Duration::try_minutes(self.window_minutes).is_none()
        {
            anyhow::bail!(
                "Policy '{}' ({}) has windowMinutes {} above the maximum of {}",
                command,
                tier,
                self.window_minutes,
                MAX_WINDOW_MINUTES
            );
        }
        if self.limit > 0 && self.window_minutes == 0 {
            anyhow::bail!(
                "Policy '{}' ({}) has limit {} but no windowMinutes",
                command,
                tier,
                self.limit
            );
        }
        Ok(())
    }
}

/// Tiered policy for a single command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPolicy {
    /// Normalized command name (`default` for the fallback entry)
    pub command_name: String,

    /// Limit for premium users
    pub premium: Option<TierLimit>,

    /// Limit for everyone else
    pub non_premium: Option<TierLimit>,
}

impl CommandPolicy {
    /// Create a command policy
    pub fn new(
        command_name: &str,
        premium: Option<TierLimit>,
        non_premium: Option<TierLimit>,
    ) -> Self {
        Self {
            command_name: normalize_command_name(command_name),
            premium,
            non_premium,
        }
    }

    /// Tier applying to a user with the given premium flag
    pub fn tier(&self, is_premium: bool) -> Option<&TierLimit> {
        if is_premium {
            self.premium.as_ref()
        } else {
            self.non_premium.as_ref()
        }
    }
}

/// One entry of a policy document as written on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    #[serde(default)]
    pub premium: Option<TierLimit>,

    #[serde(default, alias = "non_premium")]
    pub non_premium: Option<TierLimit>,
}

/// Outcome of a policy lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPolicy<'a> {
    /// The command has its own entry
    Explicit(&'a CommandPolicy),
    /// The `default` entry applies
    Default(&'a CommandPolicy),
    /// Neither an entry nor a default exists
    Unconfigured,
}

impl<'a> ResolvedPolicy<'a> {
    /// The matched policy, if any
    pub fn policy(&self) -> Option<&'a CommandPolicy> {
        match self {
            ResolvedPolicy::Explicit(p) | ResolvedPolicy::Default(p) => Some(p),
            ResolvedPolicy::Unconfigured => None,
        }
    }

    /// Tier for the caller, if configured
    pub fn tier(&self, is_premium: bool) -> Option<&'a TierLimit> {
        self.policy().and_then(|p| p.tier(is_premium))
    }
}

/// Read-only table of command policies
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    commands: HashMap<String, CommandPolicy>,
    default: Option<CommandPolicy>,
}

impl PolicyStore {
    /// Build a store from a default policy and explicit command policies
    pub fn new(default: Option<CommandPolicy>, commands: Vec<CommandPolicy>) -> Self {
        let default = default.map(|mut p| {
            p.command_name = DEFAULT_POLICY_KEY.to_string();
            p
        });
        let commands = commands
            .into_iter()
            .map(|p| (p.command_name.clone(), p))
            .collect();
        Self { commands, default }
    }

    /// Build a store from parsed document entries, validating every tier
    pub fn from_entries(entries: HashMap<String, PolicyEntry>) -> Result<Self> {
        let mut default = None;
        let mut commands = Vec::with_capacity(entries.len());
        let mut seen = HashSet::with_capacity(entries.len());

        for (name, entry) in entries {
            let key = normalize_command_name(&name);
            if key.is_empty() {
                anyhow::bail!("Policy document contains an empty command name");
            }
            if !seen.insert(key.clone()) {
                anyhow::bail!(
                    "Policy document has more than one entry for command '{}' (last seen as '{}')",
                    key,
                    name
                );
            }
            if let Some(tier) = &entry.premium {
                tier.validate(&key, "premium")?;
            }
            if let Some(tier) = &entry.non_premium {
                tier.validate(&key, "nonPremium")?;
            }

            let policy = CommandPolicy::new(&key, entry.premium, entry.non_premium);
            if key == DEFAULT_POLICY_KEY {
                default = Some(policy);
            } else {
                commands.push(policy);
            }
        }

        Ok(Self::new(default, commands))
    }

    /// Parse a JSON policy document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let entries: HashMap<String, PolicyEntry> =
            serde_json::from_str(content).context("Failed to parse JSON policy document")?;
        Self::from_entries(entries)
    }

    /// Parse a TOML policy document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let entries: HashMap<String, PolicyEntry> =
            toml::from_str(content).context("Failed to parse TOML policy document")?;
        Self::from_entries(entries)
    }

    /// Load a policy document, choosing the parser from the file extension
    /// (`.toml` for TOML, anything else is read as JSON)
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy document from {:?}", path))?;

        let store = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
        .with_context(|| format!("Invalid policy document {:?}", path))?;

        tracing::info!(
            commands = store.commands.len(),
            has_default = store.default.is_some(),
            "Loaded command policies from {:?}",
            path
        );
        Ok(store)
    }

    /// Resolve the policy for a command
    pub fn resolve(&self, command_name: &str) -> ResolvedPolicy<'_> {
        let key = normalize_command_name(command_name);
        if let Some(policy) = self.commands.get(&key) {
            return ResolvedPolicy::Explicit(policy);
        }
        match &self.default {
            Some(policy) => ResolvedPolicy::Default(policy),
            None => ResolvedPolicy::Unconfigured,
        }
    }

    /// The `default` policy, if configured
    pub fn default_policy(&self) -> Option<&CommandPolicy> {
        self.default.as_ref()
    }

    /// All explicit policies ordered by command name
    pub fn commands(&self) -> Vec<&CommandPolicy> {
        let ordered: BTreeMap<&String, &CommandPolicy> = self.commands.iter().collect();
        ordered.into_values().collect()
    }

    /// Number of explicit command entries
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when there are no explicit entries and no default
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.default.is_none()
    }
}

/// Canonical form of a command name: trimmed, one leading `/` or `!` removed,
/// lowercased
pub fn normalize_command_name(name: &str) -> String {
    let trimmed = name.trim();
    let stripped = trimmed
        .strip_prefix('/')
        .or_else(|| trimmed.strip_prefix('!'))
        .unwrap_or(trimmed);
    stripped.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const DOC: &str = r#"{
        "default": {
            "premium": { "limit": -1 },
            "nonPremium": { "limit": 20, "windowMinutes": 60 }
        },
        "imagine": {
            "premium": { "limit": 30, "windowMinutes": 60 },
            "nonPremium": { "limit": 0 }
        },
        "Sticker": {
            "nonPremium": { "limit": 3, "windowMinutes": 10 }
        }
    }"#;

    #[test]
    fn test_rule_classification() {
        assert_eq!(TierLimit::unlimited().rule(), TierRule::Unlimited);
        assert_eq!(TierLimit::disabled().rule(), TierRule::Disabled);
        assert_eq!(
            TierLimit::new(3, 10).rule(),
            TierRule::Bounded {
                limit: 3,
                window: Duration::minutes(10)
            }
        );
    }

    #[test]
    fn test_resolve_explicit_and_default() {
        let store = PolicyStore::from_json_str(DOC).unwrap();

        match store.resolve("imagine") {
            ResolvedPolicy::Explicit(p) => {
                assert_eq!(p.tier(false), Some(&TierLimit::disabled()));
                assert_eq!(p.tier(true), Some(&TierLimit::new(30, 60)));
            }
            other => panic!("expected explicit policy, got {:?}", other),
        }

        match store.resolve("weather") {
            ResolvedPolicy::Default(p) => assert_eq!(p.command_name, "default"),
            other => panic!("expected default policy, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_normalizes_names() {
        let store = PolicyStore::from_json_str(DOC).unwrap();
        assert!(matches!(store.resolve("/STICKER "), ResolvedPolicy::Explicit(_)));
        assert!(matches!(store.resolve("!imagine"), ResolvedPolicy::Explicit(_)));
    }

    #[test]
    fn test_missing_tier_is_none() {
        let store = PolicyStore::from_json_str(DOC).unwrap();
        assert_eq!(store.resolve("sticker").tier(true), None);
    }

    #[test]
    fn test_unconfigured_without_default() {
        let store = PolicyStore::new(
            None,
            vec![CommandPolicy::new("ask", None, Some(TierLimit::new(5, 1)))],
        );
        assert_eq!(store.resolve("other"), ResolvedPolicy::Unconfigured);
        assert_eq!(store.resolve("other").tier(false), None);
    }

    #[test]
    fn test_bounded_tier_requires_window() {
        let doc = r#"{ "ask": { "nonPremium": { "limit": 5 } } }"#;
        assert!(PolicyStore::from_json_str(doc).is_err());
    }

    #[test]
    fn test_negative_window_rejected() {
        let doc = r#"{ "ask": { "premium": { "limit": -1, "windowMinutes": -5 } } }"#;
        assert!(PolicyStore::from_json_str(doc).is_err());
    }

    #[test]
    fn test_oversized_window_rejected() {
        let above_max = format!(
            r#"{{ "ask": {{ "nonPremium": {{ "limit": 1, "windowMinutes": {} }} }} }}"#,
            MAX_WINDOW_MINUTES + 1
        );
        assert!(PolicyStore::from_json_str(&above_max).is_err());

        let huge = r#"{ "ask": { "nonPremium": { "limit": 1, "windowMinutes": 1000000000000 } } }"#;
        assert!(PolicyStore::from_json_str(huge).is_err());

        let overflow = format!(
            r#"{{ "ask": {{ "premium": {{ "limit": 1, "windowMinutes": {} }} }} }}"#,
            i64::MAX
        );
        assert!(PolicyStore::from_json_str(&overflow).is_err());

        let at_max = format!(
            r#"{{ "ask": {{ "nonPremium": {{ "limit": 1, "windowMinutes": {} }} }} }}"#,
            MAX_WINDOW_MINUTES
        );
        assert!(PolicyStore::from_json_str(&at_max).is_ok());
    }

    #[test]
    fn test_rule_clamps_unvalidated_window() {
        assert_eq!(
            TierLimit::new(1, i64::MAX).rule(),
            TierRule::Bounded {
                limit: 1,
                window: Duration::minutes(MAX_WINDOW_MINUTES)
            }
        );
    }

    #[test]
    fn test_duplicate_normalized_names_rejected() {
        let doc = r#"{
            "Sticker": { "nonPremium": { "limit": 1, "windowMinutes": 10 } },
            "/sticker": { "nonPremium": { "limit": 50, "windowMinutes": 10 } }
        }"#;
        let err = PolicyStore::from_json_str(doc).unwrap_err();
        assert!(err.to_string().contains("more than one entry for command 'sticker'"));

        let defaults = r#"{
            "default": { "premium": { "limit": -1 } },
            "!Default": { "premium": { "limit": 0 } }
        }"#;
        assert!(PolicyStore::from_json_str(defaults).is_err());
    }

    #[test]
    fn test_duplicate_names_in_toml_rejected() {
        let doc = "[\"/ask\".premium]\nlimit = -1\n\n[ASK.premium]\nlimit = 0\n";
        assert!(PolicyStore::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_snake_case_alias_accepted() {
        let doc = r#"{ "ask": { "non_premium": { "limit": 2, "windowMinutes": 1 } } }"#;
        let store = PolicyStore::from_json_str(doc).unwrap();
        assert_eq!(store.resolve("ask").tier(false), Some(&TierLimit::new(2, 1)));
    }

    #[test]
    fn test_load_toml_document() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        fs::write(
            file.path(),
            r#"
[default.nonPremium]
limit = 10
windowMinutes = 60

[ask.premium]
limit = -1
"#,
        )
        .unwrap();

        let store = PolicyStore::load_from_path(file.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.default_policy().and_then(|p| p.tier(false)),
            Some(&TierLimit::new(10, 60))
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("missing");
        assert!(PolicyStore::load_from_path(path).is_err());
    }

    #[test]
    fn test_commands_are_sorted() {
        let store = PolicyStore::from_json_str(DOC).unwrap();
        let names: Vec<&str> = store
            .commands()
            .iter()
            .map(|p| p.command_name.as_str())
            .collect();
        assert_eq!(names, vec!["imagine", "sticker"]);
    }
}
