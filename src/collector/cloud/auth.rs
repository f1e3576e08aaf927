//! OAuth refresh-token handling for the cloud API.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};

use crate::collector::CollectorError;
use crate::config::CloudSecrets;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
}

struct AccessToken {
    value: SecretString,
    refresh_at: Instant,
}

/// Exchanges the long-lived refresh token for short-lived access tokens.
///
/// The current access token is cached until shortly before it expires or
/// until [`invalidate`](Self::invalidate) is called after the API rejected it.
pub struct TokenManager {
    client: Client,
    token_url: String,
    credentials: CloudSecrets,
    timeout: Duration,
    cached: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(
        client: Client,
        token_url: impl Into<String>,
        credentials: CloudSecrets,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            credentials,
            timeout,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> Result<SecretString, CollectorError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let token = self.refresh().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn refresh(&self) -> Result<AccessToken, CollectorError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.credentials.refresh_token.expose_secret()),
            ("client_id", self.credentials.client_id.expose_secret()),
            ("client_secret", self.credentials.client_secret.expose_secret()),
        ];

        let request = async {
            let response = self.client.post(&self.token_url).form(&form).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };
        let (status, body) = timeout(self.timeout, request)
            .await
            .map_err(|_| CollectorError::Timeout(self.timeout))??;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let error = serde_json::from_slice::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED || error == "invalid_grant" {
                return Err(CollectorError::AuthRevoked(format!(
                    "token endpoint rejected the refresh token (HTTP {}{})",
                    status.as_u16(),
                    if error.is_empty() { String::new() } else { format!(", {error}") }
                )));
            }
        }
        if !status.is_success() {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                endpoint: "token".to_string(),
            });
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            CollectorError::InvalidResponse(format!("token response has wrong shape: {e}"))
        })?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
        tracing::debug!(expires_in = ?lifetime, "Access token refreshed");

        Ok(AccessToken {
            value: SecretString::from(token.access_token),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}
