//! OAuth Alert
//!
//! A plain-text marker file signalling that cloud authentication needs a
//! human to re-authorize. The cloud collector owns the marker: it creates it
//! on a permanent auth failure and deletes it after the next successful
//! authenticated call. Everything else only reads it.
//!
//! When a [`NotificationConfig`] is present, a JSON webhook is sent the first
//! time an alert is raised. Without one, notification is a no-op.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::config::NotificationConfig;

const HEADER: &str = "OAUTH TOKEN REFRESH NEEDED";

/// Default remediation for a revoked cloud refresh token.
pub const DEFAULT_REMEDIATION: &str = "Re-authorize the cloud account, store the new refresh token as \
     cloud.refresh_token in the secrets file, then restart collection. \
     This marker is removed automatically after the next successful call.";

/// Errors touching the marker file or sending a notification.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("alert file is malformed: {0}")]
    Malformed(String),

    #[error("notification failed: {0}")]
    Notify(String),
}

/// Contents of an active alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OAuthAlert {
    pub timestamp: DateTime<Utc>,
    pub collector: String,
    /// Error detail; never contains credential values.
    pub error: String,
    pub remediation: String,
}

impl OAuthAlert {
    pub fn new(collector: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            collector: collector.into(),
            error: error.into(),
            remediation: DEFAULT_REMEDIATION.to_string(),
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = remediation.into();
        self
    }

    fn render(&self) -> String {
        format!(
            "{HEADER}\n\
             timestamp: {}\n\
             collector: {}\n\
             error: {}\n\
             remediation: {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.collector,
            one_line(&self.error),
            one_line(&self.remediation),
        )
    }

    fn parse(content: &str) -> Result<Self, AlertError> {
        let field = |key: &str| {
            content
                .lines()
                .find_map(|line| line.strip_prefix(key)?.strip_prefix(": "))
                .map(str::to_string)
                .ok_or_else(|| AlertError::Malformed(format!("missing '{key}'")))
        };

        let timestamp = DateTime::parse_from_rfc3339(&field("timestamp")?)
            .map_err(|e| AlertError::Malformed(format!("timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            timestamp,
            collector: field("collector")?,
            error: field("error")?,
            remediation: field("remediation")?,
        })
    }
}

fn one_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

/// The marker file.
#[derive(Debug, Clone)]
pub struct AlertFile {
    path: PathBuf,
}

impl AlertFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the marker unless one is already present.
    ///
    /// Returns `true` when this call created it. An existing marker keeps
    /// the details of the first failure.
    pub fn raise(&self, alert: &OAuthAlert) -> Result<bool, AlertError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(alert.render().as_bytes())?;
        file.sync_all()?;
        Ok(true)
    }

    /// Delete the marker. Returns `true` if one was present.
    pub fn clear(&self) -> Result<bool, AlertError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.path.is_file()
    }

    /// Read the active alert, if any.
    pub fn read(&self) -> Result<Option<OAuthAlert>, AlertError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => OAuthAlert::parse(&content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    #[serde(flatten)]
    alert: &'a OAuthAlert,
}

/// Out-of-band alert notification.
#[derive(Debug, Clone)]
pub struct Notifier {
    target: Option<(Client, String, Duration)>,
}

impl Notifier {
    /// A notifier that does nothing.
    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// Build from optional configuration; `None` yields a no-op notifier.
    pub fn from_config(config: Option<&NotificationConfig>) -> Result<Self, AlertError> {
        let Some(config) = config else {
            return Ok(Self::disabled());
        };
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AlertError::Notify(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            target: Some((client, config.webhook_url.clone(), config.timeout)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// POST the alert to the webhook.
    pub async fn send(&self, alert: &OAuthAlert) -> Result<(), AlertError> {
        let Some((client, url, timeout)) = &self.target else {
            return Ok(());
        };

        let request = client.post(url).json(&WebhookPayload {
            event: "oauth_alert",
            alert,
        });
        let response = tokio::time::timeout(*timeout, request.send())
            .await
            .map_err(|_| AlertError::Notify(format!("timed out after {timeout:?}")))?
            .map_err(|e| AlertError::Notify(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Notify(format!(
                "webhook returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    /// Send, logging instead of returning any failure.
    pub async fn notify(&self, alert: &OAuthAlert) {
        if !self.is_enabled() {
            return;
        }
        match self.send(alert).await {
            Ok(()) => tracing::info!(collector = %alert.collector, "OAuth alert notification sent"),
            Err(e) => tracing::warn!(
                collector = %alert.collector,
                error = %e,
                "OAuth alert notification failed"
            ),
        }
    }
}
