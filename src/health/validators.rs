//! Built-in component validators.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use super::{CheckFailure, CheckOutcome, Validator};
use crate::alert::AlertFile;
use crate::collector::CollectorError;
use crate::collector::bridge::BridgeClient;
use crate::collector::cloud::CloudApi;
use crate::config::{
    AppConfig, BridgeConfig, BridgeSecrets, CloudConfig, CloudSecrets, CollectorsConfig,
    ConfigError, LoggingConfig, Secrets,
};
use crate::logging::{DiskSpace, FsDiskSpace};
use crate::perf::PayloadMeter;
use crate::storage::{ReadingStore, StorageBuilder};

/// Lazily opened database shared by the database validators.
///
/// Opened as found on disk: never created, never switched to WAL, never
/// given a schema.
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    path: PathBuf,
    store: Arc<OnceCell<Result<ReadingStore, String>>>,
}

impl DatabaseHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: Arc::new(OnceCell::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn store(&self) -> Result<&ReadingStore, CheckFailure> {
        let opened = self
            .store
            .get_or_init(|| async {
                StorageBuilder::new(&self.path)
                    .max_connections(2)
                    .inspect()
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;

        opened.as_ref().map_err(|e| {
            CheckFailure::new(
                format!("cannot open database '{}': {e}", self.path.display()),
                "check that database.path points at an existing database file the service can read and write",
            )
        })
    }
}

/// Run filesystem-bound work on the blocking pool so the checker's timeout
/// still applies when a mount hangs.
async fn off_runtime<F>(check: F) -> CheckOutcome
where
    F: FnOnce() -> CheckOutcome + Send + 'static,
{
    tokio::task::spawn_blocking(check).await.unwrap_or_else(|e| {
        Err(CheckFailure::new(
            format!("check task failed: {e}"),
            "inspect the logs for a crash in this validator",
        ))
    })
}

/// WAL journaling is active.
#[derive(Debug)]
pub struct JournalModeValidator {
    db: DatabaseHandle,
}

impl JournalModeValidator {
    pub fn new(db: DatabaseHandle) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl Validator for JournalModeValidator {
    fn name(&self) -> &str {
        "journal_mode"
    }

    async fn check(&self) -> CheckOutcome {
        let store = self.db.store().await?;
        let mode = store.journal_mode().await.map_err(|e| {
            CheckFailure::new(
                format!("cannot read journal mode: {e}"),
                "check database file permissions",
            )
        })?;

        if mode.is_wal() {
            Ok("journal_mode=wal".to_string())
        } else {
            Err(CheckFailure::new(
                format!("journal_mode={mode}; concurrent writers will contend for locks"),
                "store the database on a local filesystem that supports shared memory so WAL can be enabled",
            ))
        }
    }
}

/// Configuration file present, parseable and within valid ranges.
#[derive(Debug)]
pub struct ConfigValidator {
    path: PathBuf,
}

impl ConfigValidator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Validator for ConfigValidator {
    fn name(&self) -> &str {
        "config"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn check(&self) -> CheckOutcome {
        let path = self.path.clone();
        off_runtime(move || check_config(&path)).await
    }
}

fn check_config(path: &Path) -> CheckOutcome {
    let remediation = format!("fix the configuration file '{}'", path.display());
    if !path.is_file() {
        return Err(CheckFailure::new(
            format!("configuration file '{}' not found", path.display()),
            remediation,
        ));
    }

    match AppConfig::load(path) {
        Ok(config) => {
            let enabled = usize::from(config.collectors.enabled_bridge().is_some())
                + usize::from(config.collectors.enabled_cloud().is_some());
            Ok(format!("configuration valid, {enabled} collector(s) enabled"))
        }
        // YAML errors can quote values; report the location only.
        Err(ConfigError::ParseError(e)) => {
            let location = e
                .location()
                .map(|l| format!(" at line {}, column {}", l.line(), l.column()))
                .unwrap_or_default();
            Err(CheckFailure::new(
                format!("configuration is not valid YAML{location}"),
                remediation,
            ))
        }
        Err(e) => Err(CheckFailure::new(e.to_string(), remediation)),
    }
}

/// Secrets file present and complete for the enabled collectors.
#[derive(Debug)]
pub struct SecretsValidator {
    path: PathBuf,
    collectors: CollectorsConfig,
}

impl SecretsValidator {
    pub fn new(path: impl Into<PathBuf>, collectors: CollectorsConfig) -> Self {
        Self {
            path: path.into(),
            collectors,
        }
    }
}

#[async_trait::async_trait]
impl Validator for SecretsValidator {
    fn name(&self) -> &str {
        "secrets"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn check(&self) -> CheckOutcome {
        let path = self.path.clone();
        let collectors = self.collectors.clone();
        off_runtime(move || {
            let remediation = format!(
                "provide the required keys in the secrets file '{}'",
                path.display()
            );
            let secrets =
                Secrets::load(&path).map_err(|e| CheckFailure::new(e.to_string(), &remediation))?;
            secrets
                .require_for(&collectors)
                .map_err(|e| CheckFailure::new(e.to_string(), &remediation))?;
            Ok("secrets present for enabled collectors".to_string())
        })
        .await
    }
}

/// A throwaway write succeeds and is rolled back.
#[derive(Debug)]
pub struct DatabaseWriteValidator {
    db: DatabaseHandle,
}

impl DatabaseWriteValidator {
    pub fn new(db: DatabaseHandle) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl Validator for DatabaseWriteValidator {
    fn name(&self) -> &str {
        "database_write"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn check(&self) -> CheckOutcome {
        let store = self.db.store().await?;
        store.probe_write().await.map_err(|e| {
            CheckFailure::new(
                format!("database is not writable: {e}"),
                format!(
                    "check permissions and free space for '{}' and its directory",
                    self.db.path().display()
                ),
            )
        })?;
        Ok("write probe succeeded and was rolled back".to_string())
    }
}

/// Log directory usable and rotation settings sane.
#[derive(Debug)]
pub struct LogRotationValidator {
    config: LoggingConfig,
}

impl LogRotationValidator {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Validator for LogRotationValidator {
    fn name(&self) -> &str {
        "log_rotation"
    }

    async fn check(&self) -> CheckOutcome {
        let config = self.config.clone();
        off_runtime(move || check_log_dir(&config)).await
    }
}

fn check_log_dir(config: &LoggingConfig) -> CheckOutcome {
    config
        .validate()
        .map_err(|e| CheckFailure::new(e.to_string(), "fix the logging section of the configuration"))?;

    let dir = &config.dir;
    if !dir.is_dir() {
        return Err(CheckFailure::new(
            format!("log directory '{}' does not exist", dir.display()),
            "create the directory or point logging.dir at an existing one",
        ));
    }

    let probe = dir.join(format!(".health-probe-{}", uuid::Uuid::new_v4()));
    let writable = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map(drop);
    let _ = fs::remove_file(&probe);
    writable.map_err(|e| {
        CheckFailure::new(
            format!("log directory '{}' is not writable: {}", dir.display(), e.kind()),
            "grant the service write access to the log directory",
        )
    })?;

    if let Ok(available) = FsDiskSpace.available_bytes(dir)
        && available < config.min_free_bytes
    {
        return Err(CheckFailure::new(
            format!(
                "only {available} bytes free, below the {} byte rotation margin",
                config.min_free_bytes
            ),
            "free disk space; rotation is skipped while space is low",
        ));
    }

    Ok(format!(
        "'{}' writable, rotating at {} bytes with {} backups",
        dir.display(),
        config.max_bytes,
        config.backup_count
    ))
}

/// Bridge answers a sensor listing.
#[derive(Debug)]
pub struct BridgeApiValidator {
    config: BridgeConfig,
    secrets: Option<BridgeSecrets>,
    timeout: Duration,
}

impl BridgeApiValidator {
    pub fn new(config: BridgeConfig, secrets: Option<BridgeSecrets>, timeout: Duration) -> Self {
        Self {
            config,
            secrets,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Validator for BridgeApiValidator {
    fn name(&self) -> &str {
        "bridge_api"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn check(&self) -> CheckOutcome {
        let Some(secrets) = &self.secrets else {
            return Err(CheckFailure::new(
                "bridge credentials unavailable",
                "set bridge.username in the secrets file",
            ));
        };
        let client = BridgeClient::new(&self.config.base_url, secrets.username.clone(), self.timeout)
            .map_err(|e| CheckFailure::new(e.to_string(), "check collectors.bridge settings"))?;

        match client.fetch_sensors(&PayloadMeter::new()).await {
            Ok(sensors) => Ok(format!("{} sensor(s) listed", sensors.len())),
            Err(e @ CollectorError::Api { code: 1, .. }) => Err(CheckFailure::new(
                e.to_string(),
                "register a new API user on the bridge and update bridge.username in the secrets file",
            )),
            Err(e) => Err(CheckFailure::new(
                e.to_string(),
                format!(
                    "check that the bridge at {} is powered and reachable from this host",
                    self.config.base_url
                ),
            )),
        }
    }
}

/// Cloud API answers a device listing.
#[derive(Debug)]
pub struct CloudApiValidator {
    config: CloudConfig,
    secrets: Option<CloudSecrets>,
    timeout: Duration,
}

impl CloudApiValidator {
    pub fn new(config: CloudConfig, secrets: Option<CloudSecrets>, timeout: Duration) -> Self {
        Self {
            config,
            secrets,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Validator for CloudApiValidator {
    fn name(&self) -> &str {
        "cloud_api"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn check(&self) -> CheckOutcome {
        let Some(secrets) = &self.secrets else {
            return Err(CheckFailure::new(
                "cloud credentials unavailable",
                "set cloud.client_id, cloud.client_secret and cloud.refresh_token in the secrets file",
            ));
        };
        let api = CloudApi::new(&self.config, secrets, self.timeout)
            .map_err(|e| CheckFailure::new(e.to_string(), "check collectors.cloud settings"))?;

        match api.list_devices(&PayloadMeter::new()).await {
            Ok(devices) => {
                let matching = devices
                    .iter()
                    .filter(|d| d.kind == self.config.device_type)
                    .count();
                Ok(format!(
                    "{} device(s) listed, {matching} of type {}",
                    devices.len(),
                    self.config.device_type
                ))
            }
            Err(e) if e.is_auth_revoked() => Err(CheckFailure::new(
                e.to_string(),
                "re-authorize the cloud account and update cloud.refresh_token in the secrets file",
            )),
            Err(e) => Err(CheckFailure::new(
                e.to_string(),
                format!("check network access to {}", self.config.api_base),
            )),
        }
    }
}

/// No OAuth alert marker is present. Only reads the marker.
#[derive(Debug)]
pub struct OAuthAlertValidator {
    alert: AlertFile,
}

impl OAuthAlertValidator {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            alert: AlertFile::new(path),
        }
    }
}

#[async_trait::async_trait]
impl Validator for OAuthAlertValidator {
    fn name(&self) -> &str {
        "oauth_alert"
    }

    async fn check(&self) -> CheckOutcome {
        let alert = self.alert.clone();
        off_runtime(move || check_alert(&alert)).await
    }
}

fn check_alert(marker: &AlertFile) -> CheckOutcome {
    match marker.read() {
        Ok(None) => Ok("no active OAuth alert".to_string()),
        Ok(Some(alert)) => Err(CheckFailure::new(
            format!(
                "OAuth alert raised by {} at {}: {}",
                alert.collector,
                alert.timestamp.to_rfc3339(),
                alert.error
            ),
            alert.remediation,
        )),
        Err(e) => Err(CheckFailure::new(
            format!("alert marker '{}' present but unreadable: {e}", marker.path().display()),
            "re-authorize the cloud account; the marker is removed after the next successful call",
        )),
    }
}
