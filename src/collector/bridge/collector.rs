//! Local bridge collector.
//!
//! One lightweight listing request per cycle supplies both discovery and the
//! sensor state. Temperature and humidity sensors that share a hardware
//! address are merged into a single device.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::{Value, json};

use super::client::{BridgeClient, BridgeSensor, SensorMap};
use crate::collector::{Collector, CollectorError, Device, Schedule};
use crate::config::{BridgeConfig, BridgeSecrets};
use crate::perf::PayloadMeter;
use crate::retry::{Retrier, RetryPolicy};
use crate::storage::{Reading, ReadingStore, SensorType};

/// Collector name used in logs, reports and the performance baseline.
pub const BRIDGE_COLLECTOR_NAME: &str = "bridge";

const TEMPERATURE_TYPE: &str = "ZLLTemperature";
const HUMIDITY_TYPE: &str = "ZLLHumidity";
const DEVICE_KIND: &str = "ZLLSensor";
const LASTUPDATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Bridge values are reported in hundredths.
const CENTI: f64 = 100.0;

/// Local bridge sensor collector.
pub struct BridgeCollector {
    source_type: String,
    location: Option<String>,
    schedule: Schedule,
    client: BridgeClient,
    retrier: Retrier,
    store: ReadingStore,
    meter: PayloadMeter,
}

impl std::fmt::Debug for BridgeCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCollector")
            .field("source_type", &self.source_type)
            .field("schedule", &self.schedule)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl BridgeCollector {
    /// # Errors
    /// Returns `CollectorError::Config` for an invalid schedule or HTTP client.
    pub fn new(
        config: &BridgeConfig,
        secrets: &BridgeSecrets,
        retry: RetryPolicy,
        store: ReadingStore,
    ) -> Result<Self, CollectorError> {
        let schedule = config
            .schedule()
            .map_err(|e| CollectorError::Config(e.to_string()))?;
        let client = BridgeClient::new(&config.base_url, secrets.username.clone(), config.timeout)?;

        Ok(Self {
            source_type: config.source_type.clone(),
            location: config.location.clone(),
            schedule,
            client,
            retrier: Retrier::new(retry),
            store,
            meter: PayloadMeter::new(),
        })
    }

    /// Fetch the sensor listing, falling back to the full configuration dump
    /// when the lightweight response does not have the expected shape.
    pub async fn fetch_sensors(&self) -> Result<SensorMap, CollectorError> {
        let lightweight = self
            .retrier
            .run("bridge.list_sensors", || self.client.fetch_sensors(&self.meter))
            .await
            .map_err(CollectorError::from);

        match lightweight {
            Err(CollectorError::InvalidResponse(reason)) => {
                tracing::warn!(
                    reason = %reason,
                    "Lightweight sensor listing failed shape validation; using full configuration"
                );
                self.meter.mark_fallback();
                self.retrier
                    .run("bridge.full_config", || self.client.fetch_full_config(&self.meter))
                    .await
                    .map_err(CollectorError::from)
            }
            other => other,
        }
    }
}

/// Group temperature and humidity sensors by hardware address.
pub fn group_devices(sensors: &SensorMap, location: Option<&str>) -> Vec<Device> {
    let mut devices: Vec<Device> = Vec::new();

    for (sensor_id, sensor) in sensors {
        if sensor.kind != TEMPERATURE_TYPE && sensor.kind != HUMIDITY_TYPE {
            continue;
        }
        let key = sensor.device_key(sensor_id);
        let entry = json!({ "type": sensor.kind, "state": sensor.state });

        match devices.iter_mut().find(|d| d.id == key) {
            Some(device) => {
                if let Some(Value::Array(parts)) = device.state.as_mut() {
                    parts.push(entry);
                }
            }
            None => {
                let mut device = Device::new(key, display_name(sensor), DEVICE_KIND);
                device.location = location.map(str::to_string);
                device.state = Some(Value::Array(vec![entry]));
                devices.push(device);
            }
        }
    }
    devices
}

fn display_name(sensor: &BridgeSensor) -> String {
    sensor.name.trim().to_string()
}

fn lastupdated(state: &Value) -> Result<Option<DateTime<FixedOffset>>, CollectorError> {
    match state.get("lastupdated").and_then(Value::as_str) {
        None | Some("none") => Ok(None),
        Some(raw) => NaiveDateTime::parse_from_str(raw, LASTUPDATED_FORMAT)
            .map(|naive| Some(naive.and_utc().fixed_offset()))
            .map_err(|e| CollectorError::InvalidResponse(format!("malformed lastupdated '{raw}': {e}"))),
    }
}

/// Build a reading from a grouped device's captured state.
///
/// The reading takes the most recent `lastupdated` of its sensors.
/// Sensors that never reported are left out, giving a partial reading.
pub fn device_reading(
    device: &Device,
    source_type: &str,
) -> Result<Option<Reading>, CollectorError> {
    let Some(Value::Array(parts)) = &device.state else {
        return Ok(None);
    };

    let mut timestamp: Option<DateTime<FixedOffset>> = None;
    let mut measurements = Vec::new();

    for part in parts {
        let state = &part["state"];
        let (field, sensor_type) = match part["type"].as_str() {
            Some(TEMPERATURE_TYPE) => ("temperature", SensorType::Temperature),
            Some(HUMIDITY_TYPE) => ("humidity", SensorType::Humidity),
            _ => continue,
        };
        let Some(raw) = state.get(field).and_then(Value::as_f64) else {
            continue;
        };
        let Some(ts) = lastupdated(state)? else {
            continue;
        };

        timestamp = Some(timestamp.map_or(ts, |current| current.max(ts)));
        measurements.push((sensor_type, raw / CENTI));
    }

    let Some(timestamp) = timestamp else {
        return Ok(None);
    };

    let mut reading = Reading::new(device.device_id(source_type), timestamp);
    if let Some(location) = &device.location {
        reading = reading.with_location(location);
    }
    for (sensor_type, value) in measurements {
        reading = reading.with_measurement(sensor_type, value);
    }
    Ok(Some(reading))
}

#[async_trait::async_trait]
impl Collector for BridgeCollector {
    fn name(&self) -> &str {
        BRIDGE_COLLECTOR_NAME
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
        let sensors = self.fetch_sensors().await?;
        let devices = group_devices(&sensors, self.location.as_deref());
        tracing::debug!(
            sensors = sensors.len(),
            devices = devices.len(),
            payload_bytes = self.meter.bytes(),
            optimization = self.meter.status().as_ref(),
            "Bridge devices discovered"
        );
        Ok(devices)
    }

    async fn collect_reading(&self, device: &Device) -> Result<Option<Reading>, CollectorError> {
        let reading = device_reading(device, &self.source_type)?;
        if let Some(reading) = &reading
            && reading.measurements.len() < 2
        {
            tracing::info!(
                device_id = %reading.device_id,
                measurements = reading.measurements.len(),
                "Partial bridge reading"
            );
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::bridge::client::parse_sensor_listing;

    fn sensors() -> SensorMap {
        parse_sensor_listing(
            br#"{
            "5": {"name": "Hall temp", "type": "ZLLTemperature",
                  "uniqueid": "00:17:88:01:aa:bb:cc:dd-02-0402",
                  "state": {"temperature": 2150, "lastupdated": "2025-01-01T00:00:00"}},
            "6": {"name": "Hall humidity", "type": "ZLLHumidity",
                  "uniqueid": "00:17:88:01:aa:bb:cc:dd-02-0405",
                  "state": {"humidity": 4512, "lastupdated": "2025-01-01T00:00:03"}},
            "7": {"name": "Attic temp", "type": "ZLLTemperature",
                  "uniqueid": "00:17:88:01:11:22:33:44-02-0402",
                  "state": {"temperature": 1875, "lastupdated": "2025-01-01T00:01:00"}},
            "8": {"name": "Attic presence", "type": "ZLLPresence",
                  "uniqueid": "00:17:88:01:11:22:33:44-02-0406",
                  "state": {"presence": false, "lastupdated": "2025-01-01T00:01:00"}},
            "9": {"name": "Cellar temp", "type": "ZLLTemperature",
                  "uniqueid": "00:17:88:01:99:99:99:99-02-0402",
                  "state": {"temperature": null, "lastupdated": "none"}}
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_group_by_hardware_address() {
        let devices = group_devices(&sensors(), Some("home"));
        assert_eq!(devices.len(), 3);
        let hall = devices
            .iter()
            .find(|d| d.id == "00:17:88:01:aa:bb:cc:dd")
            .unwrap();
        assert_eq!(hall.name, "Hall temp");
        assert_eq!(hall.location.as_deref(), Some("home"));
        assert_eq!(hall.state.as_ref().unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_merged_reading_converts_units() {
        let devices = group_devices(&sensors(), None);
        let hall = devices
            .iter()
            .find(|d| d.id == "00:17:88:01:aa:bb:cc:dd")
            .unwrap();
        let reading = device_reading(hall, "hue").unwrap().unwrap();

        assert_eq!(reading.device_id.to_string(), "hue:00:17:88:01:aa:bb:cc:dd");
        assert_eq!(reading.value(SensorType::Temperature), Some(21.5));
        assert_eq!(reading.value(SensorType::Humidity), Some(45.12));
        assert_eq!(reading.timestamp.to_rfc3339(), "2025-01-01T00:00:03+00:00");
    }

    #[test]
    fn test_partial_and_empty_devices() {
        let devices = group_devices(&sensors(), None);

        let attic = devices.iter().find(|d| d.id.ends_with("11:22:33:44")).unwrap();
        let reading = device_reading(attic, "hue").unwrap().unwrap();
        assert_eq!(reading.measurements.len(), 1);
        assert_eq!(reading.value(SensorType::Humidity), None);

        let cellar = devices.iter().find(|d| d.id.ends_with("99:99:99:99")).unwrap();
        assert_eq!(device_reading(cellar, "hue").unwrap(), None);
    }

    #[test]
    fn test_malformed_lastupdated_rejected() {
        let sensors = parse_sensor_listing(
            br#"{"1": {"name": "t", "type": "ZLLTemperature", "uniqueid": "aa-02",
                  "state": {"temperature": 2000, "lastupdated": "yesterday"}}}"#,
        )
        .unwrap();
        let devices = group_devices(&sensors, None);
        let err = device_reading(&devices[0], "hue").unwrap_err();
        assert!(err.to_string().contains("malformed lastupdated"));
    }
}
