//! Collector configuration structures.
//!
//! Collectors are configured only under `collectors.<name>`; the section is
//! closed (`deny_unknown_fields`) so a misplaced key fails at load time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::Schedule;

use super::validation::{ConfigError, validate_http_url};

/// Default collection interval (5 minutes).
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(300);

/// Default per-call network timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloud device type collected when none is configured.
pub const DEFAULT_CLOUD_DEVICE_TYPE: &str = "AIR_QUALITY_MONITOR";

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_bridge_source() -> String {
    "hue".to_string()
}

fn default_cloud_source() -> String {
    "alexa".to_string()
}

fn default_device_type() -> String {
    DEFAULT_CLOUD_DEVICE_TYPE.to_string()
}

/// Collectors configuration, one optional section per vendor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorsConfig {
    /// Local bridge collector.
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,

    /// Cloud OAuth collector.
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
}

/// Local bridge (REST, username-in-path) collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bridge base URL, e.g. `http://192.168.1.2`.
    pub base_url: String,

    /// Fixed collection interval (default 5m). Mutually exclusive with `cron`.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// 6-field cron expression.
    #[serde(default)]
    pub cron: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Prefix for device identifiers.
    #[serde(default = "default_bridge_source")]
    pub source_type: String,

    /// Location label attached to every reading.
    #[serde(default)]
    pub location: Option<String>,
}

/// Cloud OAuth collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// API base URL; device endpoints live under `{api_base}/v1`.
    pub api_base: String,

    /// OAuth token endpoint.
    pub token_url: String,

    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_cloud_source")]
    pub source_type: String,

    /// Only devices of this type are collected.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

fn build_schedule(
    key: &str,
    interval: Option<Duration>,
    cron: Option<&str>,
) -> Result<Schedule, ConfigError> {
    match (interval, cron) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            key,
            "cannot specify both interval and cron",
        )),
        (_, Some(expr)) => Schedule::cron(expr).map_err(|e| ConfigError::invalid(key, e)),
        (Some(interval), None) => {
            if interval < crate::collector::MIN_INTERVAL {
                return Err(ConfigError::invalid(key, "interval must be at least 1s"));
            }
            Ok(Schedule::interval(interval))
        }
        (None, None) => Ok(Schedule::interval(DEFAULT_COLLECT_INTERVAL)),
    }
}

fn validate_common(key: &str, timeout: Duration, source_type: &str) -> Result<(), ConfigError> {
    if timeout.is_zero() {
        return Err(ConfigError::invalid(
            &format!("{key}.timeout"),
            "must be greater than zero",
        ));
    }
    if source_type.trim().is_empty() || source_type.contains(':') {
        return Err(ConfigError::invalid(
            &format!("{key}.source_type"),
            "must be non-empty and must not contain ':'",
        ));
    }
    Ok(())
}

impl BridgeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            base_url: base_url.into(),
            interval: None,
            cron: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            source_type: default_bridge_source(),
            location: None,
        }
    }

    /// Resolved execution schedule.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        build_schedule(
            "collectors.bridge.interval",
            self.interval,
            self.cron.as_deref(),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("collectors.bridge.base_url", &self.base_url)?;
        validate_common("collectors.bridge", self.timeout, &self.source_type)?;
        self.schedule()?;
        Ok(())
    }
}

impl CloudConfig {
    pub fn new(api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            api_base: api_base.into(),
            token_url: token_url.into(),
            interval: None,
            cron: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            source_type: default_cloud_source(),
            device_type: default_device_type(),
        }
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        build_schedule(
            "collectors.cloud.interval",
            self.interval,
            self.cron.as_deref(),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("collectors.cloud.api_base", &self.api_base)?;
        validate_http_url("collectors.cloud.token_url", &self.token_url)?;
        validate_common("collectors.cloud", self.timeout, &self.source_type)?;
        if self.device_type.trim().is_empty() {
            return Err(ConfigError::invalid(
                "collectors.cloud.device_type",
                "must not be empty",
            ));
        }
        self.schedule()?;
        Ok(())
    }
}

impl CollectorsConfig {
    /// Enabled bridge section, if any.
    pub fn enabled_bridge(&self) -> Option<&BridgeConfig> {
        self.bridge.as_ref().filter(|b| b.enabled)
    }

    /// Enabled cloud section, if any.
    pub fn enabled_cloud(&self) -> Option<&CloudConfig> {
        self.cloud.as_ref().filter(|c| c.enabled)
    }

    /// Validate all collector configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bridge) = &self.bridge {
            bridge.validate()?;
        }
        if let Some(cloud) = &self.cloud {
            cloud.validate()?;
        }
        if let (Some(bridge), Some(cloud)) = (&self.bridge, &self.cloud)
            && bridge.source_type == cloud.source_type
        {
            return Err(ConfigError::invalid(
                "collectors",
                format!(
                    "bridge and cloud share source_type '{}'; device ids would collide",
                    bridge.source_type
                ),
            ));
        }
        Ok(())
    }
}
