//! Secrets loading.
//!
//! Credentials live in a separate YAML file and are held as [`SecretString`]
//! from the moment they are parsed. Error messages name keys, never values.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::collector::CollectorsConfig;
use super::validation::{ConfigError, expand_env_vars};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSecrets {
    #[serde(default)]
    bridge: Option<RawBridgeSecrets>,
    #[serde(default)]
    cloud: Option<RawCloudSecrets>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBridgeSecrets {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCloudSecrets {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Local bridge credentials.
#[derive(Debug, Clone)]
pub struct BridgeSecrets {
    /// API user created on the bridge; sent in the URL path.
    pub username: SecretString,
}

/// Cloud OAuth client credentials.
#[derive(Debug, Clone)]
pub struct CloudSecrets {
    pub client_id: SecretString,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
}

/// All credentials; `Debug` output is redacted.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub bridge: Option<BridgeSecrets>,
    pub cloud: Option<CloudSecrets>,
}

fn secret(value: Option<String>) -> SecretString {
    SecretString::from(value.map(|v| expand_env_vars(&v)).unwrap_or_default())
}

fn is_blank(secret: &SecretString) -> bool {
    secret.expose_secret().trim().is_empty()
}

impl Secrets {
    /// Load and parse the secrets file.
    ///
    /// Values may reference environment variables with `${VAR}` syntax.
    /// Parse errors report only the location, since the YAML error text can
    /// quote the offending value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Secrets(format!("cannot read '{}': {}", path.display(), e.kind()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse secrets from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: RawSecrets = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!(" at line {}, column {}", l.line(), l.column()))
                .unwrap_or_default();
            ConfigError::Secrets(format!("secrets file is not well-formed{location}"))
        })?;

        // Blank values are kept here and reported by `require_for`.
        Ok(Self {
            bridge: raw.bridge.map(|b| BridgeSecrets {
                username: secret(b.username),
            }),
            cloud: raw.cloud.map(|c| CloudSecrets {
                client_id: secret(c.client_id),
                client_secret: secret(c.client_secret),
                refresh_token: secret(c.refresh_token),
            }),
        })
    }

    /// Keys required by the enabled collectors that are absent or blank.
    pub fn missing_for(&self, collectors: &CollectorsConfig) -> Vec<&'static str> {
        let mut missing = Vec::new();

        if collectors.enabled_bridge().is_some() {
            match &self.bridge {
                Some(b) if !is_blank(&b.username) => {}
                _ => missing.push("bridge.username"),
            }
        }

        if collectors.enabled_cloud().is_some() {
            match &self.cloud {
                Some(c) => {
                    if is_blank(&c.client_id) {
                        missing.push("cloud.client_id");
                    }
                    if is_blank(&c.client_secret) {
                        missing.push("cloud.client_secret");
                    }
                    if is_blank(&c.refresh_token) {
                        missing.push("cloud.refresh_token");
                    }
                }
                None => missing.extend([
                    "cloud.client_id",
                    "cloud.client_secret",
                    "cloud.refresh_token",
                ]),
            }
        }

        missing
    }

    /// Fail if any secret needed by an enabled collector is missing.
    pub fn require_for(&self, collectors: &CollectorsConfig) -> Result<(), ConfigError> {
        let missing = self.missing_for(collectors);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Secrets(format!(
                "missing required secret(s): {}",
                missing.join(", ")
            )))
        }
    }
}
