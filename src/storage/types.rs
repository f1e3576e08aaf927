//! Core data types for the storage layer.
//!
//! - [`DeviceId`]: composite `source_type:device_id` identifier
//! - [`SensorType`]: the measured quantity, with its canonical unit and column
//! - [`Measurement`]: one sensor value with its unit
//! - [`Reading`]: all measurements of one device at one instant

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::storage::StorageError;

/// Device identifier unique across vendors, rendered as `source_type:device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId {
    source_type: String,
    device_id: String,
}

impl DeviceId {
    pub fn new(source_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            device_id: device_id.into(),
        }
    }

    /// Vendor prefix, e.g. `hue`.
    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    /// Vendor-local identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Both halves are present.
    pub fn is_complete(&self) -> bool {
        !self.source_type.trim().is_empty() && !self.device_id.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.device_id)
    }
}

impl FromStr for DeviceId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, id)) if !source.is_empty() && !id.is_empty() => {
                Ok(Self::new(source, id))
            }
            _ => Err(StorageError::InvalidData(format!(
                "device id '{s}' is not of the form source_type:device_id"
            ))),
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.to_string()
    }
}

/// Measured quantity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SensorType {
    Temperature,
    Humidity,
    #[strum(to_string = "pm25", serialize = "pm2_5")]
    #[serde(rename = "pm25")]
    Pm25,
    Voc,
    Co,
    Co2,
    /// Vendor indoor-air-quality score.
    Iaq,
}

impl SensorType {
    /// Unit every stored value of this type is expressed in.
    pub fn canonical_unit(self) -> &'static str {
        match self {
            Self::Temperature => "celsius",
            Self::Humidity => "percent",
            Self::Pm25 => "ug/m3",
            Self::Voc => "ppb",
            Self::Co => "ppm",
            Self::Co2 => "ppm",
            Self::Iaq => "score",
        }
    }

    /// Column in the `readings` table.
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::Temperature => "temperature_c",
            Self::Humidity => "humidity_pct",
            Self::Pm25 => "pm25_ugm3",
            Self::Voc => "voc_ppb",
            Self::Co => "co_ppm",
            Self::Co2 => "co2_ppm",
            Self::Iaq => "iaq",
        }
    }
}

/// One sensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
}

impl Measurement {
    /// Measurement in the type's canonical unit.
    pub fn new(sensor_type: SensorType, value: f64) -> Self {
        Self {
            sensor_type,
            value,
            unit: sensor_type.canonical_unit().to_string(),
        }
    }

    /// Measurement with an explicit unit (checked during validation).
    pub fn with_unit(sensor_type: SensorType, value: f64, unit: impl Into<String>) -> Self {
        Self {
            sensor_type,
            value,
            unit: unit.into(),
        }
    }
}

/// A single device observation.
///
/// Identity is `(device_id, timestamp truncated to the second)`; the storage
/// layer enforces uniqueness on that pair. Devices that report only some
/// sensors produce a partial reading whose other columns stay NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: DeviceId,
    /// Observation time with its original UTC offset.
    pub timestamp: DateTime<FixedOffset>,
    /// Human-readable location label.
    #[serde(default)]
    pub location: Option<String>,
    /// Sensor values, at most one per sensor type.
    pub measurements: Vec<Measurement>,
}

impl Reading {
    pub fn new(device_id: DeviceId, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            device_id,
            timestamp,
            location: None,
            measurements: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Add a measurement in the canonical unit.
    pub fn with_measurement(mut self, sensor_type: SensorType, value: f64) -> Self {
        self.measurements.push(Measurement::new(sensor_type, value));
        self
    }

    /// Add a measurement as reported.
    pub fn push(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    /// Value recorded for `sensor_type`, if present.
    pub fn value(&self, sensor_type: SensorType) -> Option<f64> {
        self.measurements
            .iter()
            .find(|m| m.sensor_type == sensor_type)
            .map(|m| m.value)
    }

    /// Unix seconds used for deduplication.
    pub fn timestamp_second(&self) -> i64 {
        self.timestamp.timestamp()
    }
}
