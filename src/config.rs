//! Configuration module for sensorium.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Database settings (path, busy timeout, WAL checkpointing, write retry)
//! - Retry defaults for collector network calls
//! - Log file rotation
//! - Collector definitions (`collectors.bridge`, `collectors.cloud`)
//! - OAuth alert marker, performance baseline and health check timing
//!
//! Credentials are loaded separately through [`Secrets`].

mod app;
mod collector;
mod secrets;
mod validation;

pub use app::{
    AlertConfig, AppConfig, DatabaseConfig, HealthConfig, LoggingConfig, NotificationConfig,
    PerformanceConfig, RetryConfig,
};
pub use collector::{BridgeConfig, CloudConfig, CollectorsConfig};
pub use secrets::{BridgeSecrets, CloudSecrets, Secrets};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{
    DEFAULT_HEALTH_TIMEOUT, DEFAULT_LOG_BACKUP_COUNT, DEFAULT_LOG_MAX_BYTES,
    DEFAULT_MIN_FREE_BYTES, DEFAULT_NETWORK_CHECK_TIMEOUT,
};
pub use collector::{DEFAULT_CLOUD_DEVICE_TYPE, DEFAULT_COLLECT_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
