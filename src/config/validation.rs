//! Configuration errors and shared field checks.

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A value is out of range; the message starts with the dotted key.
    #[error("config validation error: {0}")]
    ValidationError(String),

    /// Secrets file missing, malformed or incomplete. Never carries secret values.
    #[error("secrets error: {0}")]
    Secrets(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::ValidationError(format!("{key}: {reason}"))
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references from the environment.
///
/// Unset variables without a default expand to the empty string.
///
/// ```
/// use sensorium::config::expand_env_vars;
///
/// assert_eq!(expand_env_vars("${SENSORIUM_UNSET_DOC_VAR:-data}/readings.db"), "data/readings.db");
/// ```
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

/// Check that `value` parses as an absolute http(s) URL.
pub(crate) fn validate_http_url(key: &str, value: &str) -> Result<url::Url, ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::invalid(key, format!("invalid URL '{value}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ConfigError::invalid(
            key,
            format!("unsupported URL scheme '{other}'"),
        )),
    }
}
