//! Local bridge collector.
//!
//! - [`BridgeClient`]: REST client with username-in-path auth
//! - [`BridgeCollector`]: groups sensors into devices and produces readings

mod client;
mod collector;

pub use client::{
    BridgeClient, BridgeSensor, FULL_CONFIG_ENDPOINT, SENSORS_ENDPOINT, SensorMap,
    parse_full_config, parse_sensor_listing,
};
pub use collector::{BRIDGE_COLLECTOR_NAME, BridgeCollector, device_reading, group_devices};
