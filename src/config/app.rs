//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{PolicyError, RetryPolicy};

use super::collector::CollectorsConfig;
use super::validation::{ConfigError, expand_env_vars, validate_http_url};

// =============================================================================
// Constants
// =============================================================================

/// Default log rotation threshold (10 MiB).
pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated log backups.
pub const DEFAULT_LOG_BACKUP_COUNT: u32 = 5;

/// Default free-space margin below which rotation is skipped (50 MiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 50 * 1024 * 1024;

/// Default hard timeout for a whole health check run.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for network health validators.
pub const DEFAULT_NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn default_db_path() -> PathBuf {
    PathBuf::from("data/readings.db")
}

fn default_busy_timeout() -> Duration {
    crate::storage::DEFAULT_BUSY_TIMEOUT
}

fn default_wal_autocheckpoint() -> u32 {
    crate::storage::DEFAULT_WAL_AUTOCHECKPOINT
}

fn default_secrets_path() -> PathBuf {
    PathBuf::from("config/secrets.yaml")
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Retry policy as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Upper bound on any single backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,

    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            base_delay: crate::retry::DEFAULT_BASE_DELAY,
            multiplier: crate::retry::DEFAULT_MULTIPLIER,
            max_delay: Some(Duration::from_secs(30)),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Build the validated runtime policy.
    pub fn policy(&self) -> Result<RetryPolicy, PolicyError> {
        let mut policy = RetryPolicy::new(self.max_attempts, self.base_delay, self.multiplier)?
            .with_jitter(self.jitter);
        if let Some(max_delay) = self.max_delay {
            policy = policy.with_max_delay(max_delay);
        }
        Ok(policy)
    }

    fn validate(&self, key: &str) -> Result<(), ConfigError> {
        self.policy().map_err(|e| ConfigError::invalid(key, e))?;
        if let Some(max_delay) = self.max_delay
            && max_delay < self.base_delay
        {
            return Err(ConfigError::invalid(
                &format!("{key}.max_delay"),
                "must not be smaller than base_delay",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: PathBuf,

    /// How long SQLite waits on a lock before reporting it.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// WAL auto-checkpoint threshold in pages.
    pub wal_autocheckpoint: u32,

    /// Lock-contention retry policy around each insert.
    pub write_retry: RetryConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout: default_busy_timeout(),
            wal_autocheckpoint: default_wal_autocheckpoint(),
            write_retry: RetryConfig::default(),
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Log file and rotation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Directory holding the active log and its backups.
    pub dir: PathBuf,

    pub file_name: String,

    /// Rotation threshold for the active file.
    pub max_bytes: u64,

    /// Backups kept besides the active file.
    pub backup_count: u32,

    /// Rotation is skipped when the filesystem has less free space than this.
    pub min_free_bytes: u64,

    /// Retry policy for filesystem errors during rotation.
    pub retry: RetryConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "sensorium.log".to_string(),
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backup_count: DEFAULT_LOG_BACKUP_COUNT,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            retry: RetryConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Path of the active log file.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_name.trim().is_empty() || self.file_name.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "logging.file_name",
                "must be a plain, non-empty file name",
            ));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::invalid("logging.max_bytes", "must be positive"));
        }
        if self.backup_count == 0 {
            return Err(ConfigError::invalid(
                "logging.backup_count",
                "must be at least 1",
            ));
        }
        self.retry.validate("logging.retry")
    }
}

// =============================================================================
// Alert / Performance / Health Configuration
// =============================================================================

/// Optional out-of-band notification when an OAuth alert is raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Webhook receiving a JSON POST.
    pub webhook_url: String,

    #[serde(default = "default_notify_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(10)
}

/// OAuth alert marker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertConfig {
    /// Marker file; present means re-authorization is required.
    pub path: PathBuf,

    pub notification: Option<NotificationConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ALERT_TOKEN_REFRESH_NEEDED.txt"),
            notification: None,
        }
    }
}

/// Performance baseline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformanceConfig {
    pub baseline_path: PathBuf,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            baseline_path: PathBuf::from("data/performance_baseline.json"),
        }
    }
}

/// Health check timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Hard wall-clock bound for the whole check.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Per-validator bound for the API reachability checks.
    #[serde(with = "humantime_serde")]
    pub network_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HEALTH_TIMEOUT,
            network_timeout: DEFAULT_NETWORK_CHECK_TIMEOUT,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Default retry policy for collector network calls.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Collector configurations, keyed by collector.
    #[serde(default)]
    pub collectors: CollectorsConfig,

    #[serde(default)]
    pub alert: AlertConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Path to the secrets YAML file.
    #[serde(default = "default_secrets_path")]
    pub secrets_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            collectors: CollectorsConfig::default(),
            alert: AlertConfig::default(),
            performance: PerformanceConfig::default(),
            health: HealthConfig::default(),
            secrets_path: default_secrets_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("database.path", "must not be empty"));
        }
        self.database.write_retry.validate("database.write_retry")?;
        self.retry.validate("retry")?;
        self.logging.validate()?;
        self.collectors.validate()?;

        if self.alert.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("alert.path", "must not be empty"));
        }
        if let Some(notification) = &self.alert.notification {
            validate_http_url("alert.notification.webhook_url", &notification.webhook_url)?;
        }

        if self.health.timeout.is_zero() {
            return Err(ConfigError::invalid(
                "health.timeout",
                "must be greater than zero",
            ));
        }
        if self.health.network_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "health.network_timeout",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}
