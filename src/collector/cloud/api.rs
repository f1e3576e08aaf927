//! Authenticated requests against the cloud device API.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use url::Url;

use super::auth::TokenManager;
use crate::collector::CollectorError;
use crate::config::{CloudConfig, CloudSecrets};
use crate::perf::PayloadMeter;

/// Device listing endpoint.
pub const DEVICES_PATH: &str = "/v1/devices";

const DEVICES_SEGMENTS: [&str; 2] = ["v1", "devices"];

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: Vec<CloudDevice>,
}

/// One entry of the device listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CloudDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// `GET /v1/devices/{id}/state` body.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceState {
    pub timestamp: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Capability {
    pub instance: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Bearer-authenticated cloud API client. Each call is a single attempt.
pub struct CloudApi {
    client: Client,
    api_base: Url,
    auth: TokenManager,
    timeout: Duration,
}

impl std::fmt::Debug for CloudApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudApi")
            .field("api_base", &self.api_base.as_str())
            .field("auth", &self.auth)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CloudApi {
    /// # Errors
    /// Returns `CollectorError::Config` if `api_base` is not a URL or the HTTP
    /// client cannot be built.
    pub fn new(
        config: &CloudConfig,
        secrets: &CloudSecrets,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let api_base = Url::parse(&config.api_base).map_err(|e| {
            CollectorError::Config(format!("invalid collectors.cloud.api_base: {e}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to build HTTP client: {e}")))?;
        let auth = TokenManager::new(client.clone(), &config.token_url, secrets.clone(), timeout);

        Ok(Self {
            client,
            api_base,
            auth,
            timeout,
        })
    }

    /// `api_base` extended by `segments`, each percent-encoded as one path segment.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, CollectorError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                CollectorError::Config(format!(
                    "collectors.cloud.api_base '{}' cannot carry a path",
                    self.api_base
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// One authenticated GET. A 401 drops the cached token and is transient.
    ///
    /// `path` names the endpoint in errors; the request goes to `url`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        path: &str,
        meter: &PayloadMeter,
    ) -> Result<T, CollectorError> {
        let token = self.auth.access_token().await?;
        let request = async {
            let response = self
                .client
                .get(url)
                .bearer_auth(token.expose_secret())
                .send()
                .await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };
        let (status, body) = timeout(self.timeout, request)
            .await
            .map_err(|_| CollectorError::Timeout(self.timeout))??;
        meter.record(body.len());

        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
            return Err(CollectorError::AuthExpired(format!(
                "API rejected the access token for {path}"
            )));
        }
        if !status.is_success() {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                endpoint: path.to_string(),
            });
        }
        serde_json::from_slice(&body)
            .map_err(|e| CollectorError::InvalidResponse(format!("{path}: {e}")))
    }

    /// Every device on the account, unfiltered.
    pub async fn list_devices(&self, meter: &PayloadMeter) -> Result<Vec<CloudDevice>, CollectorError> {
        let url = self.endpoint(&DEVICES_SEGMENTS)?;
        let list: DeviceList = self.get(url, DEVICES_PATH, meter).await?;
        Ok(list.devices)
    }

    pub async fn device_state(
        &self,
        device_id: &str,
        meter: &PayloadMeter,
    ) -> Result<DeviceState, CollectorError> {
        let url = self.endpoint(&[DEVICES_SEGMENTS[0], DEVICES_SEGMENTS[1], device_id, "state"])?;
        self.get(url, &format!("{DEVICES_PATH}/{device_id}/state"), meter)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn api(api_base: &str) -> CloudApi {
        let secrets = CloudSecrets {
            client_id: SecretString::from("id".to_string()),
            client_secret: SecretString::from("secret".to_string()),
            refresh_token: SecretString::from("refresh".to_string()),
        };
        CloudApi::new(
            &CloudConfig::new(api_base, "https://auth.example.com/token"),
            &secrets,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_device_id_is_one_path_segment() {
        let api = api("https://api.example.com");
        let url = api
            .endpoint(&["v1", "devices", "air/1?x=1#frag", "state"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/devices/air%2F1%3Fx=1%23frag/state"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = api("https://api.example.com/tenant/");
        let url = api.endpoint(&DEVICES_SEGMENTS).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/tenant/v1/devices");
    }

    #[test]
    fn test_invalid_base_rejected() {
        let secrets = CloudSecrets {
            client_id: SecretString::from("id".to_string()),
            client_secret: SecretString::from("secret".to_string()),
            refresh_token: SecretString::from("refresh".to_string()),
        };
        let err = CloudApi::new(
            &CloudConfig::new("not a url", "https://auth.example.com/token"),
            &secrets,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.to_string().contains("api_base"));
    }
}
