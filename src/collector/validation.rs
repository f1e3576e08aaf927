//! Reading validation shared by every collector.
//!
//! A reading is rejected as a whole when any check fails. Readings that carry
//! only some sensor types are accepted as partial readings.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use thiserror::Error;

use crate::storage::{Reading, SensorType};

/// Readings stamped further than this into the future are rejected.
const MAX_CLOCK_SKEW_SECS: i64 = 24 * 60 * 60;

/// Earliest timestamp accepted (2000-01-01T00:00:00Z).
const EARLIEST_TIMESTAMP_SECS: i64 = 946_684_800;

/// Reason a reading was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("device id is incomplete: '{0}'")]
    MissingDeviceId(String),

    #[error("reading has no measurements")]
    NoMeasurements,

    #[error("implausible timestamp {0}")]
    ImplausibleTimestamp(String),

    #[error("{0}: value is not a finite number")]
    NotFinite(SensorType),

    #[error("{sensor_type}: {value} outside plausible range {min}..={max} {unit}")]
    OutOfRange {
        sensor_type: SensorType,
        value: f64,
        min: f64,
        max: f64,
        unit: &'static str,
    },

    #[error("{0}: missing unit")]
    MissingUnit(SensorType),

    #[error("{sensor_type}: unit '{unit}' is not '{expected}'")]
    WrongUnit {
        sensor_type: SensorType,
        unit: String,
        expected: &'static str,
    },

    #[error("{0}: reported more than once")]
    DuplicateSensor(SensorType),
}

/// Physically plausible indoor range, in the canonical unit.
pub fn plausible_range(sensor_type: SensorType) -> (f64, f64) {
    match sensor_type {
        SensorType::Temperature => (0.0, 40.0),
        SensorType::Humidity => (0.0, 100.0),
        SensorType::Pm25 => (0.0, 1000.0),
        SensorType::Voc => (0.0, 10_000.0),
        SensorType::Co => (0.0, 1000.0),
        SensorType::Co2 => (0.0, 10_000.0),
        SensorType::Iaq => (0.0, 500.0),
    }
}

/// Validate against the current time.
pub fn validate_reading(reading: &Reading) -> Vec<ValidationError> {
    validate_reading_at(reading, Utc::now())
}

/// Validate against an explicit "now".
pub fn validate_reading_at(reading: &Reading, now: DateTime<Utc>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !reading.device_id.is_complete() {
        errors.push(ValidationError::MissingDeviceId(
            reading.device_id.to_string(),
        ));
    }

    if !timestamp_plausible(&reading.timestamp, now) {
        errors.push(ValidationError::ImplausibleTimestamp(
            reading.timestamp.to_rfc3339(),
        ));
    }

    if reading.measurements.is_empty() {
        errors.push(ValidationError::NoMeasurements);
    }

    let mut seen = Vec::with_capacity(reading.measurements.len());
    for m in &reading.measurements {
        if seen.contains(&m.sensor_type) {
            errors.push(ValidationError::DuplicateSensor(m.sensor_type));
            continue;
        }
        seen.push(m.sensor_type);

        let expected = m.sensor_type.canonical_unit();
        if m.unit.trim().is_empty() {
            errors.push(ValidationError::MissingUnit(m.sensor_type));
        } else if !m.unit.eq_ignore_ascii_case(expected) {
            errors.push(ValidationError::WrongUnit {
                sensor_type: m.sensor_type,
                unit: m.unit.clone(),
                expected,
            });
        }

        if !m.value.is_finite() {
            errors.push(ValidationError::NotFinite(m.sensor_type));
            continue;
        }

        let (min, max) = plausible_range(m.sensor_type);
        if !(min..=max).contains(&m.value) {
            errors.push(ValidationError::OutOfRange {
                sensor_type: m.sensor_type,
                value: m.value,
                min,
                max,
                unit: expected,
            });
        }
    }

    errors
}

fn timestamp_plausible(ts: &DateTime<FixedOffset>, now: DateTime<Utc>) -> bool {
    let earliest = Utc.timestamp_opt(EARLIEST_TIMESTAMP_SECS, 0).single();
    let latest = now + ChronoDuration::seconds(MAX_CLOCK_SKEW_SECS);
    let ts = ts.with_timezone(&Utc);
    earliest.is_some_and(|earliest| ts >= earliest) && ts <= latest
}
