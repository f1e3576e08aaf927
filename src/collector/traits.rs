//! Core collector traits and types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::validation::{ValidationError, validate_reading};
use crate::perf::{PayloadMeter, PerformanceMetric, Stopwatch};
use crate::retry::{Classify, ErrorKind, RetryError, classify_http_status, classify_reqwest};
use crate::storage::{DeviceId, InsertOutcome, Reading, ReadingStore, StorageError};

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Transport-level failure (connect, reset, TLS, body decode).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("HTTP {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    /// Per-call timeout elapsed.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Access token expired or was rejected; a refresh should fix it.
    #[error("access token rejected: {0}")]
    AuthExpired(String),

    /// Credentials can no longer be refreshed; a human must re-authorize.
    #[error("authorization revoked: {0}")]
    AuthRevoked(String),

    /// Vendor API returned its own error envelope.
    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    /// Response body did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to write a reading.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Transient failures outlasted the retry budget.
    #[error("{operation} gave up after {attempts} attempts in {elapsed:?}: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<CollectorError>,
    },
}

/// Bridge error codes at or above this value are server-side and retryable.
const FIRST_TRANSIENT_API_CODE: i64 = 900;

impl Classify for CollectorError {
    fn classify(&self) -> ErrorKind {
        match self {
            Self::Network(e) => classify_reqwest(e),
            Self::Status { status, .. } => classify_http_status(*status),
            Self::Timeout(_) | Self::AuthExpired(_) | Self::Exhausted { .. } => {
                ErrorKind::Transient
            }
            Self::Api { code, .. } if *code >= FIRST_TRANSIENT_API_CODE => ErrorKind::Transient,
            Self::Storage(e) => e.classify(),
            Self::AuthRevoked(_)
            | Self::Api { .. }
            | Self::InvalidResponse(_)
            | Self::Config(_)
            | Self::Scheduler(_) => ErrorKind::Permanent,
        }
    }
}

impl CollectorError {
    /// `true` when re-authorization by a human is required.
    pub fn is_auth_revoked(&self) -> bool {
        match self {
            Self::AuthRevoked(_) => true,
            Self::Exhausted { source, .. } => source.is_auth_revoked(),
            _ => false,
        }
    }
}

impl From<RetryError<CollectorError>> for CollectorError {
    /// Aborted sequences surface the permanent error itself; exhausted ones
    /// are wrapped with the retry diagnostics.
    fn from(err: RetryError<CollectorError>) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                elapsed,
                source,
                ..
            } => Self::Exhausted {
                operation,
                attempts,
                elapsed,
                source: Box::new(source),
            },
            RetryError::Aborted { source, .. } => source,
        }
    }
}

/// Schedule for collector execution.
///
/// Supports both fixed interval and cron-based scheduling.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval between collections.
    ///
    /// Interval is clamped to a minimum of 1 second.
    Interval(Duration),

    /// Cron expression for scheduled execution.
    ///
    /// Uses standard cron syntax: `sec min hour day month weekday` (6-field).
    /// Example: `"0 */5 * * * *"` = every 5 minutes at second 0
    Cron(String),
}

impl Schedule {
    /// Create an interval schedule.
    ///
    /// Interval is clamped to a minimum of 1 second.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Create a cron schedule with immediate validation.
    ///
    /// # Errors
    /// Returns `CollectorError::Config` if the cron expression is invalid.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, CollectorError> {
        use std::str::FromStr;

        let expr = expr.as_ref();
        cron::Schedule::from_str(expr)
            .map_err(|e| CollectorError::Config(format!("invalid cron expression: {e}")))?;

        Ok(Self::Cron(expr.to_string()))
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Self::Cron(expr) => write!(f, "cron: {}", expr),
        }
    }
}

/// A physical device discovered in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Vendor-local identifier.
    pub id: String,
    pub name: String,
    /// Vendor device type.
    pub kind: String,
    pub location: Option<String>,
    /// State captured during discovery, when the listing already carries it.
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            location: None,
            state: None,
        }
    }

    pub fn device_id(&self, source_type: &str) -> DeviceId {
        DeviceId::new(source_type, &self.id)
    }
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub collector: String,
    /// Devices discovered.
    pub devices: usize,
    /// Readings newly written.
    pub stored: usize,
    /// Readings already present for that device and second.
    pub duplicates: usize,
    /// Readings that failed validation.
    pub rejected: usize,
    /// Devices whose collection or write failed.
    pub failed: usize,
    /// Devices that reported nothing this cycle.
    pub empty: usize,
    /// Discovery failure that ended the cycle early.
    pub error: Option<String>,
    pub metric: Option<PerformanceMetric>,
}

impl CycleReport {
    pub fn new(collector: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
            ..Default::default()
        }
    }

    /// Nothing failed, was rejected, or aborted the cycle.
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.failed == 0 && self.rejected == 0
    }
}

/// Core collector trait for sensor collectors.
///
/// Implementors supply discovery and per-device collection; the provided
/// [`run_cycle`](Collector::run_cycle) ties them to validation and storage.
///
/// # Error Handling Philosophy
///
/// Failures are contained at the narrowest boundary. A device that fails is
/// counted and skipped; a discovery failure ends only this cycle. Nothing a
/// single cycle does can stop the scheduler or another collector.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Unique name of this collector instance.
    fn name(&self) -> &str;

    /// Prefix used in device identifiers.
    fn source_type(&self) -> &str;

    /// Execution schedule (interval or cron).
    fn schedule(&self) -> &Schedule;

    /// Store receiving validated readings.
    fn store(&self) -> &ReadingStore;

    /// Payload accounting for performance measurement, if the collector keeps one.
    fn payload_meter(&self) -> Option<&PayloadMeter> {
        None
    }

    /// List the devices to read this cycle.
    async fn discover_devices(&self) -> Result<Vec<Device>, CollectorError>;

    /// Read one device. `Ok(None)` means the device had nothing to report.
    async fn collect_reading(&self, device: &Device) -> Result<Option<Reading>, CollectorError>;

    /// Check a reading before it is stored. Empty means acceptable.
    fn validate(&self, reading: &Reading) -> Vec<ValidationError> {
        validate_reading(reading)
    }

    /// Discover, collect, validate and store.
    async fn run_cycle(&self) -> CycleReport {
        let name = self.name().to_string();
        let stopwatch = Stopwatch::start(&name);
        if let Some(meter) = self.payload_meter() {
            meter.reset();
        }
        let mut report = CycleReport::new(&name);

        let devices = match self.discover_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(
                    collector = %name,
                    error_kind = e.classify().as_ref(),
                    error = %e,
                    "Device discovery failed; skipping this cycle"
                );
                report.error = Some(e.to_string());
                report.metric = Some(finish(stopwatch, self.payload_meter()));
                return report;
            }
        };
        report.devices = devices.len();

        for device in &devices {
            let reading = match self.collect_reading(device).await {
                Ok(Some(reading)) => reading,
                Ok(None) => {
                    report.empty += 1;
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        collector = %name,
                        device = %device.id,
                        error_kind = e.classify().as_ref(),
                        error = %e,
                        "Device collection failed"
                    );
                    continue;
                }
            };

            let errors = self.validate(&reading);
            if !errors.is_empty() {
                report.rejected += 1;
                let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
                tracing::warn!(
                    collector = %name,
                    device_id = %reading.device_id,
                    reasons = ?reasons,
                    "Reading rejected by validation"
                );
                continue;
            }

            match self.store().insert_reading(&reading).await {
                Ok(InsertOutcome::Inserted) => report.stored += 1,
                Ok(InsertOutcome::Duplicate) => report.duplicates += 1,
                // The store has already logged the failure as critical.
                Err(_) => report.failed += 1,
            }
        }

        report.metric = Some(finish(stopwatch, self.payload_meter()));
        tracing::info!(
            collector = %name,
            devices = report.devices,
            stored = report.stored,
            duplicates = report.duplicates,
            rejected = report.rejected,
            failed = report.failed,
            "Collection cycle complete"
        );
        report
    }
}

fn finish(stopwatch: Stopwatch, meter: Option<&PayloadMeter>) -> PerformanceMetric {
    match meter {
        Some(meter) => stopwatch.finish_with(meter),
        None => stopwatch.finish(0, crate::perf::OptimizationStatus::Optimized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_interval_minimum() {
        let schedule = Schedule::interval(Duration::from_millis(100));
        match schedule {
            Schedule::Interval(d) => assert_eq!(d, MIN_INTERVAL),
            _ => panic!("expected Interval"),
        }
    }

    #[test]
    fn test_schedule_interval_valid() {
        let schedule = Schedule::interval(Duration::from_secs(300));
        assert_eq!(schedule.to_string(), "every 5m");
    }

    #[test]
    fn test_schedule_cron_valid() {
        let schedule = Schedule::cron("0 */5 * * * *").unwrap();
        match schedule {
            Schedule::Cron(expr) => assert_eq!(expr, "0 */5 * * * *"),
            _ => panic!("expected Cron"),
        }
    }

    #[test]
    fn test_schedule_cron_invalid() {
        let err = Schedule::cron("not a cron").unwrap_err();
        assert!(err.to_string().contains("invalid cron"));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            CollectorError::Timeout(Duration::from_secs(1)).classify(),
            ErrorKind::Transient
        );
        assert_eq!(
            CollectorError::AuthExpired("expired".into()).classify(),
            ErrorKind::Transient
        );
        assert_eq!(
            CollectorError::AuthRevoked("invalid_grant".into()).classify(),
            ErrorKind::Permanent
        );
        let status = |status| CollectorError::Status {
            status,
            endpoint: "/x".into(),
        };
        assert_eq!(status(429).classify(), ErrorKind::Transient);
        assert_eq!(status(503).classify(), ErrorKind::Transient);
        assert_eq!(status(404).classify(), ErrorKind::Permanent);

        let api = |code| CollectorError::Api {
            code,
            description: "x".into(),
        };
        assert_eq!(api(1).classify(), ErrorKind::Permanent);
        assert_eq!(api(901).classify(), ErrorKind::Transient);
    }

    #[test]
    fn test_retry_error_conversion() {
        let aborted = RetryError::Aborted {
            operation: "refresh_token".to_string(),
            attempts: 1,
            elapsed: Duration::ZERO,
            kind: ErrorKind::Permanent,
            source: CollectorError::AuthRevoked("invalid_grant".into()),
        };
        let err = CollectorError::from(aborted);
        assert!(matches!(err, CollectorError::AuthRevoked(_)));
        assert!(err.is_auth_revoked());

        let exhausted = RetryError::Exhausted {
            operation: "list_devices".to_string(),
            attempts: 3,
            elapsed: Duration::from_secs(3),
            kind: ErrorKind::Transient,
            source: CollectorError::Timeout(Duration::from_secs(10)),
        };
        let err = CollectorError::from(exhausted);
        assert!(err.to_string().contains("gave up after 3 attempts"));
        assert_eq!(err.classify(), ErrorKind::Transient);
        assert!(!err.is_auth_revoked());
    }

    #[test]
    fn test_device_id() {
        let device = Device::new("00:17:88:01", "Hallway", "ZLLTemperature");
        assert_eq!(device.device_id("hue").to_string(), "hue:00:17:88:01");
    }
}
