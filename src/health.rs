//! Health Check
//!
//! Independent component validators run concurrently under one wall-clock
//! bound. Every validator runs to completion (or its timeout) regardless of
//! what the others report; the overall status is the worst individual one.
//!
//! | Overall    | Exit code |
//! |------------|-----------|
//! | `pass`     | 0         |
//! | `fail`     | 1         |
//! | `critical` | 2         |
//!
//! Validators report presence and format of credentials only, never values.

mod validators;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::task::JoinSet;
use tokio::time::Instant;

pub use validators::{
    BridgeApiValidator, CloudApiValidator, ConfigValidator, DatabaseHandle, DatabaseWriteValidator,
    JournalModeValidator, LogRotationValidator, OAuthAlertValidator, SecretsValidator,
};

use crate::config::{AppConfig, Secrets};

/// Result of one validator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Critical,
}

impl CheckStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Critical => 2,
        }
    }
}

/// A failed check: what is wrong and what to do about it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub message: String,
    pub remediation: String,
}

impl CheckFailure {
    pub fn new(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            remediation: remediation.into(),
        }
    }
}

/// `Ok` carries a short pass message.
pub type CheckOutcome = Result<String, CheckFailure>;

/// One component check.
///
/// Implementations read configuration and credentials but never change
/// persistent state, and never put a secret value into their output.
#[async_trait::async_trait]
pub trait Validator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// A failing critical validator makes the whole report critical.
    fn is_critical(&self) -> bool {
        false
    }

    /// Own bound, further capped by the checker's overall timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn check(&self) -> CheckOutcome;
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// In registration order.
    pub results: Vec<CheckResult>,
    pub overall: CheckStatus,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl HealthReport {
    fn from_results(results: Vec<CheckResult>, elapsed: Duration) -> Self {
        let overall = results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(CheckStatus::Pass);
        Self {
            results,
            overall,
            elapsed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.overall.exit_code()
    }

    pub fn result(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Plain-text report for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for r in &self.results {
            let _ = writeln!(
                out,
                "[{:>8}] {:<14} {} ({} ms)",
                r.status.as_ref().to_uppercase(),
                r.name,
                r.message,
                r.elapsed.as_millis()
            );
            if let Some(remediation) = &r.remediation {
                let _ = writeln!(out, "           -> {remediation}");
            }
        }
        let _ = writeln!(
            out,
            "overall: {} (exit {}) in {} ms",
            self.overall,
            self.exit_code(),
            self.elapsed.as_millis()
        );
        out
    }
}

/// Runs validators concurrently under a hard overall timeout.
pub struct HealthChecker {
    validators: Vec<Arc<dyn Validator>>,
    timeout: Duration,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            validators: Vec::new(),
            timeout,
        }
    }

    pub fn with_validator(mut self, validator: impl Validator) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push(&mut self, validator: Arc<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The standard validator set for an application configuration.
    ///
    /// `config` is whatever could be loaded from `config_path` (defaults if
    /// loading failed, which the `config` validator reports). The API checks
    /// are included only for enabled collectors.
    pub fn standard(config_path: impl Into<std::path::PathBuf>, config: &AppConfig) -> Self {
        let secrets = Secrets::load(&config.secrets_path).ok();
        let database = DatabaseHandle::new(config.database.path.clone());
        let network_timeout = config.health.network_timeout;

        let mut checker = Self::new(config.health.timeout)
            .with_validator(JournalModeValidator::new(database.clone()))
            .with_validator(ConfigValidator::new(config_path))
            .with_validator(SecretsValidator::new(
                config.secrets_path.clone(),
                config.collectors.clone(),
            ))
            .with_validator(DatabaseWriteValidator::new(database))
            .with_validator(LogRotationValidator::new(config.logging.clone()));

        if let Some(bridge) = config.collectors.enabled_bridge() {
            checker = checker.with_validator(BridgeApiValidator::new(
                bridge.clone(),
                secrets.as_ref().and_then(|s| s.bridge.clone()),
                network_timeout,
            ));
        }
        if let Some(cloud) = config.collectors.enabled_cloud() {
            checker = checker.with_validator(CloudApiValidator::new(
                cloud.clone(),
                secrets.as_ref().and_then(|s| s.cloud.clone()),
                network_timeout,
            ));
        }
        checker.with_validator(OAuthAlertValidator::new(&config.alert.path))
    }

    /// Run every validator and assemble the report.
    pub async fn run(&self) -> HealthReport {
        let started = Instant::now();
        let mut results: Vec<CheckResult> = self
            .validators
            .iter()
            .map(|v| CheckResult {
                name: v.name().to_string(),
                status: failed_status(v.as_ref()),
                message: "check did not complete".to_string(),
                remediation: Some("inspect the logs for a crash in this validator".to_string()),
                elapsed: Duration::ZERO,
            })
            .collect();

        let mut set = JoinSet::new();
        for (index, validator) in self.validators.iter().enumerate() {
            let validator = Arc::clone(validator);
            let limit = validator
                .timeout()
                .map_or(self.timeout, |t| t.min(self.timeout));
            set.spawn(async move {
                let began = Instant::now();
                let outcome = tokio::time::timeout(limit, validator.check()).await;
                (index, evaluate(validator.as_ref(), outcome, limit, began.elapsed()))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = result,
                Err(e) => tracing::error!(error = %e, "Health validator task panicked"),
            }
        }

        let report = HealthReport::from_results(results, started.elapsed());
        for r in &report.results {
            tracing::debug!(
                check = %r.name,
                status = r.status.as_ref(),
                elapsed_ms = r.elapsed.as_millis() as u64,
                "Health check result"
            );
        }
        tracing::info!(
            overall = report.overall.as_ref(),
            checks = report.results.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Health check complete"
        );
        report
    }
}

fn failed_status(validator: &dyn Validator) -> CheckStatus {
    if validator.is_critical() {
        CheckStatus::Critical
    } else {
        CheckStatus::Fail
    }
}

fn evaluate(
    validator: &dyn Validator,
    outcome: Result<CheckOutcome, tokio::time::error::Elapsed>,
    limit: Duration,
    elapsed: Duration,
) -> CheckResult {
    let name = validator.name().to_string();
    match outcome {
        Ok(Ok(message)) => CheckResult {
            name,
            status: CheckStatus::Pass,
            message,
            remediation: None,
            elapsed,
        },
        Ok(Err(failure)) => CheckResult {
            name,
            status: failed_status(validator),
            message: failure.message,
            remediation: Some(failure.remediation),
            elapsed,
        },
        Err(_) => CheckResult {
            name,
            status: failed_status(validator),
            message: format!("timed out after {}", humantime::format_duration(limit)),
            remediation: Some(
                "the component did not answer in time; check that it is reachable and not overloaded"
                    .to_string(),
            ),
            elapsed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        critical: bool,
        delay: Duration,
        outcome: CheckOutcome,
    }

    impl Fixed {
        fn pass(name: &'static str) -> Self {
            Self {
                name,
                critical: false,
                delay: Duration::ZERO,
                outcome: Ok("ok".into()),
            }
        }

        fn fail(name: &'static str, critical: bool) -> Self {
            Self {
                name,
                critical,
                delay: Duration::ZERO,
                outcome: Err(CheckFailure::new("broken", "fix it")),
            }
        }
    }

    #[async_trait::async_trait]
    impl Validator for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn is_critical(&self) -> bool {
            self.critical
        }

        async fn check(&self) -> CheckOutcome {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn test_all_pass_exits_zero() {
        let report = HealthChecker::new(Duration::from_secs(1))
            .with_validator(Fixed::pass("a"))
            .with_validator(Fixed::pass("b"))
            .run()
            .await;
        assert_eq!(report.overall, CheckStatus::Pass);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn test_non_critical_failure_exits_one() {
        let report = HealthChecker::new(Duration::from_secs(1))
            .with_validator(Fixed::pass("a"))
            .with_validator(Fixed::fail("b", false))
            .run()
            .await;
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.result("b").unwrap().remediation.as_deref(), Some("fix it"));
        assert_eq!(report.result("a").unwrap().status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn test_critical_failure_exits_two_and_others_still_run() {
        let report = HealthChecker::new(Duration::from_secs(1))
            .with_validator(Fixed::fail("db", true))
            .with_validator(Fixed::fail("api", false))
            .with_validator(Fixed::pass("logs"))
            .run()
            .await;
        assert_eq!(report.exit_code(), 2);
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["db", "api", "logs"]);
        assert_eq!(report.result("logs").unwrap().status, CheckStatus::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_validator_times_out_as_failure() {
        let mut slow = Fixed::pass("slow");
        slow.delay = Duration::from_secs(60);

        let report = HealthChecker::new(Duration::from_secs(15))
            .with_validator(slow)
            .with_validator(Fixed::pass("fast"))
            .run()
            .await;

        let slow = report.result("slow").unwrap();
        assert_eq!(slow.status, CheckStatus::Fail);
        assert!(slow.message.contains("timed out after 15s"));
        assert!(report.elapsed <= Duration::from_secs(16));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_render() {
        let report = HealthReport::from_results(
            vec![CheckResult {
                name: "database_write".into(),
                status: CheckStatus::Critical,
                message: "not writable".into(),
                remediation: Some("check permissions".into()),
                elapsed: Duration::from_millis(3),
            }],
            Duration::from_millis(4),
        );
        let text = report.render();
        assert!(text.contains("CRITICAL"));
        assert!(text.contains("-> check permissions"));
        assert!(text.contains("overall: critical (exit 2)"));
    }
}
