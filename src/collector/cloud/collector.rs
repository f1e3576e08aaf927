//! Cloud OAuth air-quality collector.

use chrono::DateTime;

use super::api::{CloudApi, DeviceState};
use crate::alert::{AlertFile, Notifier, OAuthAlert};
use crate::collector::{Collector, CollectorError, Device, Schedule};
use crate::config::{CloudConfig, CloudSecrets};
use crate::perf::PayloadMeter;
use crate::retry::{Retrier, RetryPolicy};
use crate::storage::{Measurement, Reading, ReadingStore, SensorType};

/// Collector name used in logs, reports and the performance baseline.
pub const CLOUD_COLLECTOR_NAME: &str = "cloud";

fn sensor_type(instance: &str) -> Option<SensorType> {
    match instance.to_ascii_lowercase().as_str() {
        "temperature" => Some(SensorType::Temperature),
        "humidity" => Some(SensorType::Humidity),
        "pm25" | "pm2_5" | "pm2.5" => Some(SensorType::Pm25),
        "voc" => Some(SensorType::Voc),
        "co" => Some(SensorType::Co),
        "co2" => Some(SensorType::Co2),
        "iaq" => Some(SensorType::Iaq),
        _ => None,
    }
}

/// Convert one capability to a canonical-unit measurement.
///
/// Unknown vendor units are kept as reported so validation rejects them.
fn measurement(sensor_type: SensorType, value: f64, unit: Option<&str>) -> Measurement {
    let canonical = sensor_type.canonical_unit();
    let Some(unit) = unit.map(str::trim).filter(|u| !u.is_empty()) else {
        return Measurement::new(sensor_type, value);
    };

    match (sensor_type, unit.to_ascii_uppercase().as_str()) {
        (SensorType::Temperature, "FAHRENHEIT" | "F") => {
            Measurement::new(sensor_type, (value - 32.0) * 5.0 / 9.0)
        }
        (SensorType::Temperature, "CELSIUS" | "C") => Measurement::new(sensor_type, value),
        (SensorType::Humidity, "PERCENT" | "%") => Measurement::new(sensor_type, value),
        (SensorType::Pm25, "UG/M3" | "µG/M3" | "MICROGRAMS_PER_CUBIC_METER") => {
            Measurement::new(sensor_type, value)
        }
        (SensorType::Voc, "PPB" | "PARTS_PER_BILLION") => Measurement::new(sensor_type, value),
        (SensorType::Co | SensorType::Co2, "PPM" | "PARTS_PER_MILLION") => {
            Measurement::new(sensor_type, value)
        }
        _ if unit.eq_ignore_ascii_case(canonical) => Measurement::new(sensor_type, value),
        _ => Measurement::with_unit(sensor_type, value, unit),
    }
}

/// Build a reading from a device state document.
pub fn state_reading(
    device: &Device,
    source_type: &str,
    state: &DeviceState,
) -> Result<Option<Reading>, CollectorError> {
    let timestamp = DateTime::parse_from_rfc3339(&state.timestamp).map_err(|e| {
        CollectorError::InvalidResponse(format!("malformed timestamp '{}': {e}", state.timestamp))
    })?;

    let mut reading = Reading::new(device.device_id(source_type), timestamp);
    if let Some(location) = &device.location {
        reading = reading.with_location(location);
    }
    for capability in &state.capabilities {
        let (Some(sensor_type), Some(value)) = (sensor_type(&capability.instance), capability.value)
        else {
            continue;
        };
        reading.push(measurement(sensor_type, value, capability.unit.as_deref()));
    }

    if reading.measurements.is_empty() {
        return Ok(None);
    }
    Ok(Some(reading))
}

/// Cloud API collector authenticated with an OAuth refresh token.
///
/// A revoked refresh token raises the OAuth alert marker (and a one-time
/// notification) and ends the cycle. The marker is cleared after the next
/// successful authenticated request.
pub struct CloudCollector {
    source_type: String,
    device_type: String,
    schedule: Schedule,
    api: CloudApi,
    retrier: Retrier,
    store: ReadingStore,
    alert: AlertFile,
    notifier: Notifier,
    meter: PayloadMeter,
}

impl std::fmt::Debug for CloudCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCollector")
            .field("api", &self.api)
            .field("device_type", &self.device_type)
            .field("schedule", &self.schedule)
            .field("alert", &self.alert.path())
            .finish_non_exhaustive()
    }
}

impl CloudCollector {
    /// # Errors
    /// Returns `CollectorError::Config` for an invalid schedule or HTTP client.
    pub fn new(
        config: &CloudConfig,
        secrets: &CloudSecrets,
        retry: RetryPolicy,
        store: ReadingStore,
        alert: AlertFile,
        notifier: Notifier,
    ) -> Result<Self, CollectorError> {
        let schedule = config
            .schedule()
            .map_err(|e| CollectorError::Config(e.to_string()))?;

        Ok(Self {
            source_type: config.source_type.clone(),
            device_type: config.device_type.clone(),
            schedule,
            api: CloudApi::new(config, secrets, config.timeout)?,
            retrier: Retrier::new(retry),
            store,
            alert,
            notifier,
            meter: PayloadMeter::new(),
        })
    }

    pub fn alert_file(&self) -> &AlertFile {
        &self.alert
    }

    /// Run an API call through the retry engine, maintaining the alert marker.
    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, CollectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollectorError>>,
    {
        let result = self
            .retrier
            .run(operation, op)
            .await
            .map_err(CollectorError::from);

        match &result {
            Ok(_) => self.on_authenticated(),
            Err(e) if e.is_auth_revoked() => self.on_auth_revoked(e).await,
            Err(_) => {}
        }
        result
    }

    fn on_authenticated(&self) {
        match self.alert.clear() {
            Ok(true) => tracing::info!(
                collector = CLOUD_COLLECTOR_NAME,
                path = %self.alert.path().display(),
                "Authentication succeeded; OAuth alert cleared"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to clear OAuth alert"),
        }
    }

    async fn on_auth_revoked(&self, err: &CollectorError) {
        let alert = OAuthAlert::new(CLOUD_COLLECTOR_NAME, err.to_string());
        match self.alert.raise(&alert) {
            Ok(true) => self.notifier.notify(&alert).await,
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Failed to write OAuth alert"),
        }
        tracing::error!(
            severity = "critical",
            collector = CLOUD_COLLECTOR_NAME,
            error = %err,
            alert = %self.alert.path().display(),
            "Cloud authorization revoked; manual re-authorization required"
        );
    }
}

#[async_trait::async_trait]
impl Collector for CloudCollector {
    fn name(&self) -> &str {
        CLOUD_COLLECTOR_NAME
    }

    fn source_type(&self) -> &str {
        &self.source_type
    }

    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn store(&self) -> &ReadingStore {
        &self.store
    }

    fn payload_meter(&self) -> Option<&PayloadMeter> {
        Some(&self.meter)
    }

    async fn discover_devices(&self) -> Result<Vec<Device>, CollectorError> {
        let listed = self
            .call("cloud.list_devices", || self.api.list_devices(&self.meter))
            .await?;
        let total = listed.len();
        let devices: Vec<Device> = listed
            .into_iter()
            .filter(|d| d.kind == self.device_type)
            .map(|d| {
                let mut device = Device::new(d.id, d.name, d.kind);
                device.location = d.location;
                device
            })
            .collect();
        tracing::debug!(
            total,
            collected = devices.len(),
            device_type = %self.device_type,
            "Cloud devices discovered"
        );
        Ok(devices)
    }

    async fn collect_reading(&self, device: &Device) -> Result<Option<Reading>, CollectorError> {
        let state = self
            .call("cloud.device_state", || {
                self.api.device_state(&device.id, &self.meter)
            })
            .await?;
        let reading = state_reading(device, &self.source_type, &state)?;
        if let Some(reading) = &reading
            && reading.measurements.len() < state.capabilities.len()
        {
            tracing::info!(
                device_id = %reading.device_id,
                measurements = reading.measurements.len(),
                capabilities = state.capabilities.len(),
                "Partial cloud reading"
            );
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        let mut device = Device::new("device2", "Office monitor", "AIR_QUALITY_MONITOR");
        device.location = Some("office".into());
        device
    }

    fn state(json: &str) -> DeviceState {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_state_reading_converts_fahrenheit() {
        let state = state(
            r#"{"timestamp": "2025-01-01T00:00:01Z", "capabilities": [
                {"instance": "temperature", "value": 69.8, "unit": "FAHRENHEIT"},
                {"instance": "humidity", "value": 40, "unit": "PERCENT"},
                {"instance": "pm25", "value": 3},
                {"instance": "iaq", "value": 12},
                {"instance": "color", "value": 1}
            ]}"#,
        );
        let reading = state_reading(&device(), "alexa", &state).unwrap().unwrap();
        assert_eq!(reading.device_id.to_string(), "alexa:device2");
        assert_eq!(reading.location.as_deref(), Some("office"));
        assert!((reading.value(SensorType::Temperature).unwrap() - 21.0).abs() < 1e-9);
        assert_eq!(reading.value(SensorType::Humidity), Some(40.0));
        assert_eq!(reading.measurements.len(), 4);
        assert!(reading.measurements.iter().all(|m| m.unit == m.sensor_type.canonical_unit()));
    }

    #[test]
    fn test_unknown_unit_kept_for_validation() {
        let state = state(
            r#"{"timestamp": "2025-01-01T00:00:01Z", "capabilities": [
                {"instance": "co", "value": 1, "unit": "KELVIN"}
            ]}"#,
        );
        let reading = state_reading(&device(), "alexa", &state).unwrap().unwrap();
        assert_eq!(reading.measurements[0].unit, "KELVIN");
    }

    #[test]
    fn test_empty_and_malformed_state() {
        let empty = state(
            r#"{"timestamp": "2025-01-01T00:00:01Z",
                "capabilities": [{"instance": "voc", "value": null}]}"#,
        );
        assert_eq!(state_reading(&device(), "alexa", &empty).unwrap(), None);

        let bad = state(r#"{"timestamp": "01/01/2025", "capabilities": []}"#);
        assert!(matches!(
            state_reading(&device(), "alexa", &bad),
            Err(CollectorError::InvalidResponse(_))
        ));
    }
}
