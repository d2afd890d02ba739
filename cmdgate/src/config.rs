// Configuration File Support
//
// Configuration for the cmdgate engine and binary.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/cmdgate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Durable store configuration
    pub storage: StorageConfig,

    /// Command policy document
    pub policies: PoliciesConfig,

    /// Admission event recording
    pub analytics: AnalyticsConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file (defaults to the XDG data directory)
    pub database_path: Option<String>,

    /// Upper bound on a single storage call, in milliseconds
    pub timeout_ms: u64,

    /// How long a writer waits on a locked database, in milliseconds.
    /// Must be below `timeout_ms`.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            timeout_ms: 2000,
            busy_timeout_ms: 1500,
        }
    }
}

/// Policy document location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PoliciesConfig {
    /// JSON or TOML policy file. When unset, `policies.toml` next to the
    /// config file is used if present.
    pub path: Option<String>,
}

/// Admission event recording
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Record one event per decision
    pub enabled: bool,

    /// Write events from a background task instead of inline
    pub background: bool,

    /// Pending events buffered for the background writer
    pub queue_capacity: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            background: false,
            queue_capacity: 1024,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metrics for every command (serve-metrics always does)
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9464,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if
    /// the result fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/cmdgate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "cmdgate", "cmdgate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("cmdgate")
                .join("config.toml")
        }
    }

    /// Resolved SQLite database location
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.storage.database_path {
            return PathBuf::from(path);
        }
        match directories::ProjectDirs::from("com", "cmdgate", "cmdgate") {
            Some(proj_dirs) => proj_dirs.data_dir().join("cmdgate.db"),
            None => PathBuf::from("cmdgate.db"),
        }
    }

    /// Policy file to load, and whether it was configured explicitly
    pub fn policies_path(&self) -> (PathBuf, bool) {
        match &self.policies.path {
            Some(path) => (PathBuf::from(path), true),
            None => {
                let default = Self::config_path()
                    .parent()
                    .map(|dir| dir.join("policies.toml"))
                    .unwrap_or_else(|| PathBuf::from("policies.toml"));
                (default, false)
            }
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - CMDGATE_LOG_LEVEL
    /// - CMDGATE_LOG_FORMAT
    /// - CMDGATE_DATABASE
    /// - CMDGATE_STORAGE_TIMEOUT_MS
    /// - CMDGATE_POLICIES
    /// - CMDGATE_METRICS_ENABLED
    /// - CMDGATE_METRICS_PORT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("CMDGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("CMDGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(path) = std::env::var("CMDGATE_DATABASE") {
            self.storage.database_path = Some(path);
        }
        if let Ok(timeout) = std::env::var("CMDGATE_STORAGE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.storage.timeout_ms = timeout;
                }
            }
        }

        if let Ok(path) = std::env::var("CMDGATE_POLICIES") {
            self.policies.path = Some(path);
        }

        if let Ok(enabled) = std::env::var("CMDGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("CMDGATE_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.storage.timeout_ms == 0 {
            anyhow::bail!("Storage timeout must be > 0");
        }
        if self.storage.busy_timeout_ms == 0 {
            anyhow::bail!("Storage busy timeout must be > 0");
        }
        if self.storage.busy_timeout_ms >= self.storage.timeout_ms {
            anyhow::bail!(
                "Storage busy timeout ({} ms) must be below the storage timeout ({} ms)",
                self.storage.busy_timeout_ms,
                self.storage.timeout_ms
            );
        }
        if matches!(&self.storage.database_path, Some(path) if path.trim().is_empty()) {
            anyhow::bail!("Storage database path must not be empty");
        }

        if self.analytics.queue_capacity == 0 {
            anyhow::bail!("Analytics queue capacity must be > 0");
        }

        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Tests touching process environment run one at a time
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 7] = [
        "CMDGATE_LOG_LEVEL",
        "CMDGATE_LOG_FORMAT",
        "CMDGATE_DATABASE",
        "CMDGATE_STORAGE_TIMEOUT_MS",
        "CMDGATE_POLICIES",
        "CMDGATE_METRICS_ENABLED",
        "CMDGATE_METRICS_PORT",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.timeout_ms, 2000);
        assert!(config.analytics.enabled);
        assert!(!config.analytics.background);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9464);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_timeouts() {
        let mut config = Config::default();
        config.storage.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.busy_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_busy_timeout_below_storage_timeout() {
        let config = Config::default();
        assert!(config.storage.busy_timeout_ms < config.storage.timeout_ms);

        let mut config = Config::default();
        config.storage.busy_timeout_ms = config.storage.timeout_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be below the storage timeout"));
    }

    #[test]
    fn test_load_rejects_busy_timeout_above_storage_timeout() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(
            temp_file.path(),
            "[storage]\ntimeout_ms = 500\nbusy_timeout_ms = 5000\n",
        )
        .unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_config_validation_zero_queue_capacity() {
        let mut config = Config::default();
        config.analytics.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_metrics_port() {
        let mut config = Config::default();
        config.metrics.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[storage]
database_path = "/var/lib/cmdgate/admission.db"
timeout_ms = 500
busy_timeout_ms = 400

[policies]
path = "/etc/cmdgate/policies.json"

[analytics]
background = true
queue_capacity = 64

[metrics]
enabled = true
port = 8080
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/cmdgate/admission.db")
        );
        assert_eq!(config.storage.timeout_ms, 500);
        assert_eq!(config.storage.busy_timeout_ms, 400);
        assert_eq!(
            config.policies_path(),
            (PathBuf::from("/etc/cmdgate/policies.json"), true)
        );
        assert!(config.analytics.background);
        assert_eq!(config.analytics.queue_capacity, 64);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 8080);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging\nlevel = \"debug\"\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[analytics]\nqueue_capacity = 0\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("CMDGATE_LOG_LEVEL", "debug");
        std::env::set_var("CMDGATE_LOG_FORMAT", "json");
        std::env::set_var("CMDGATE_DATABASE", "/tmp/override.db");
        std::env::set_var("CMDGATE_STORAGE_TIMEOUT_MS", "250");
        std::env::set_var("CMDGATE_POLICIES", "/tmp/policies.json");
        std::env::set_var("CMDGATE_METRICS_ENABLED", "true");
        std::env::set_var("CMDGATE_METRICS_PORT", "9000");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/override.db"));
        assert_eq!(config.storage.timeout_ms, 250);
        assert_eq!(config.policies.path.as_deref(), Some("/tmp/policies.json"));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9000);
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("CMDGATE_STORAGE_TIMEOUT_MS", "0");
        std::env::set_var("CMDGATE_METRICS_PORT", "not-a-port");

        let config = Config::default().apply_env_overrides();
        clear_env();

        assert_eq!(config.storage.timeout_ms, 2000);
        assert_eq!(config.metrics.port, 9464);
    }

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert!(Config::config_path().ends_with("config.toml"));
        assert!(config.database_path().ends_with("cmdgate.db"));

        let (policies, explicit) = config.policies_path();
        assert!(policies.ends_with("policies.toml"));
        assert!(!explicit);
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "invalid".to_string();
        assert!(config.log_level().is_err());
    }

    #[test]
    fn test_config_partial_toml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging]\nlevel = \"warn\"\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.storage, StorageConfig::default());
        assert_eq!(config.metrics.port, 9464);
    }
}
