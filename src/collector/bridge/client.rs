//! HTTP client for the local bridge REST API.
//!
//! The API user is part of every URL path, so request errors are stripped of
//! their URL before they are surfaced and endpoints are referred to by label.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::collector::CollectorError;
use crate::perf::PayloadMeter;

/// Label for the lightweight sensor listing.
pub const SENSORS_ENDPOINT: &str = "sensors";

/// Label for the full configuration dump.
pub const FULL_CONFIG_ENDPOINT: &str = "full configuration";

/// One entry of the bridge's sensor listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeSensor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub uniqueid: Option<String>,
    pub state: serde_json::Map<String, Value>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl BridgeSensor {
    /// Physical device key: the MAC part of `uniqueid` (before the first `-`).
    pub fn device_key<'a>(&'a self, sensor_id: &'a str) -> &'a str {
        self.uniqueid
            .as_deref()
            .and_then(|u| u.split('-').next())
            .filter(|mac| !mac.is_empty())
            .unwrap_or(sensor_id)
    }
}

/// Sensors keyed by bridge-local sensor id.
pub type SensorMap = BTreeMap<String, BridgeSensor>;

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    code: i64,
    #[serde(default)]
    description: String,
}

/// Bridge REST client.
#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
    base_url: String,
    username: SecretString,
    timeout: Duration,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BridgeClient {
    /// # Errors
    /// Returns `CollectorError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        username: SecretString,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `GET /api/<user>/sensors`.
    pub async fn fetch_sensors(&self, meter: &PayloadMeter) -> Result<SensorMap, CollectorError> {
        let url = format!("{}/api/{}/sensors", self.base_url, self.username.expose_secret());
        let body = self.get(url, SENSORS_ENDPOINT, meter).await?;
        parse_sensor_listing(&body)
    }

    /// `GET /api/<user>` and take its `sensors` member.
    pub async fn fetch_full_config(&self, meter: &PayloadMeter) -> Result<SensorMap, CollectorError> {
        let url = format!("{}/api/{}", self.base_url, self.username.expose_secret());
        let body = self.get(url, FULL_CONFIG_ENDPOINT, meter).await?;
        parse_full_config(&body)
    }

    async fn get(
        &self,
        url: String,
        endpoint: &str,
        meter: &PayloadMeter,
    ) -> Result<Vec<u8>, CollectorError> {
        let request = async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = timeout(self.timeout, request)
            .await
            .map_err(|_| CollectorError::Timeout(self.timeout))?
            .map_err(|e| CollectorError::Network(e.without_url()))?;

        meter.record(body.len());
        tracing::debug!(
            endpoint,
            status = status.as_u16(),
            payload_bytes = body.len(),
            "Bridge response received"
        );

        if !status.is_success() {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        Ok(body.to_vec())
    }
}

fn parse_json(body: &[u8]) -> Result<Value, CollectorError> {
    serde_json::from_slice(body)
        .map_err(|e| CollectorError::InvalidResponse(format!("body is not JSON: {e}")))
}

/// The bridge reports errors as `[{"error": {...}}]` with a 200 status.
fn api_error(items: &[Value]) -> CollectorError {
    items
        .iter()
        .find_map(|item| serde_json::from_value::<ErrorEnvelope>(item.clone()).ok())
        .map(|env| CollectorError::Api {
            code: env.error.code,
            description: env.error.description,
        })
        .unwrap_or_else(|| CollectorError::InvalidResponse("unexpected JSON array".into()))
}

fn sensors_from(value: Value) -> Result<SensorMap, CollectorError> {
    serde_json::from_value(value)
        .map_err(|e| CollectorError::InvalidResponse(format!("sensor listing has wrong shape: {e}")))
}

/// Parse the lightweight listing: an object of sensor objects.
pub fn parse_sensor_listing(body: &[u8]) -> Result<SensorMap, CollectorError> {
    match parse_json(body)? {
        Value::Array(items) => Err(api_error(&items)),
        value @ Value::Object(_) => sensors_from(value),
        other => Err(CollectorError::InvalidResponse(format!(
            "expected an object, got {}",
            json_type(&other)
        ))),
    }
}

/// Parse the full configuration dump and extract its sensors.
pub fn parse_full_config(body: &[u8]) -> Result<SensorMap, CollectorError> {
    match parse_json(body)? {
        Value::Array(items) => Err(api_error(&items)),
        Value::Object(mut root) => match root.remove("sensors") {
            Some(sensors) => sensors_from(sensors),
            None => Err(CollectorError::InvalidResponse(
                "full configuration has no 'sensors' member".into(),
            )),
        },
        other => Err(CollectorError::InvalidResponse(format!(
            "expected an object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{Classify, ErrorKind};

    const LISTING: &str = r#"{
        "5": {"name": "Hall temp", "type": "ZLLTemperature",
              "uniqueid": "00:17:88:01:02:03:04:05-02-0402",
              "state": {"temperature": 2150, "lastupdated": "2025-01-01T00:00:00"},
              "config": {"on": true, "battery": 90}},
        "6": {"name": "Hall humidity", "type": "ZLLHumidity",
              "uniqueid": "00:17:88:01:02:03:04:05-02-0405",
              "state": {"humidity": 4512, "lastupdated": "2025-01-01T00:00:00"}}
    }"#;

    #[test]
    fn test_parse_listing() {
        let sensors = parse_sensor_listing(LISTING.as_bytes()).unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors["5"].kind, "ZLLTemperature");
        assert_eq!(sensors["5"].device_key("5"), "00:17:88:01:02:03:04:05");
        assert!(sensors["6"].config.is_empty());
    }

    #[test]
    fn test_device_key_falls_back_to_sensor_id() {
        let sensors =
            parse_sensor_listing(br#"{"1": {"name": "Daylight", "type": "Daylight", "state": {}}}"#)
                .unwrap();
        assert_eq!(sensors["1"].device_key("1"), "1");
    }

    #[test]
    fn test_error_envelope_is_permanent_api_error() {
        let body = br#"[{"error": {"type": 1, "address": "/", "description": "unauthorized user"}}]"#;
        let err = parse_sensor_listing(body).unwrap_err();
        assert!(matches!(err, CollectorError::Api { code: 1, .. }));
        assert_eq!(err.classify(), ErrorKind::Permanent);
    }

    #[test]
    fn test_wrong_shape_is_invalid_response() {
        let err = parse_sensor_listing(br#"{"5": {"name": "x"}}"#).unwrap_err();
        assert!(matches!(err, CollectorError::InvalidResponse(_)));
        let err = parse_sensor_listing(b"\"ok\"").unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[test]
    fn test_parse_full_config() {
        let body = format!(r#"{{"config": {{"name": "Bridge"}}, "lights": {{}}, "sensors": {LISTING}}}"#);
        let sensors = parse_full_config(body.as_bytes()).unwrap();
        assert_eq!(sensors.len(), 2);

        let err = parse_full_config(br#"{"lights": {}}"#).unwrap_err();
        assert!(err.to_string().contains("no 'sensors'"));
    }

    #[test]
    fn test_debug_hides_username() {
        let client = BridgeClient::new(
            "http://127.0.0.1/",
            SecretString::from("bridge-user-value".to_string()),
            Duration::from_secs(1),
        )
        .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("bridge-user-value"));
        assert!(debug.contains("http://127.0.0.1"));
    }
}
