//! Cloud OAuth collector.
//!
//! - [`TokenManager`]: refresh-token exchange and access-token caching
//! - [`CloudApi`]: single-attempt bearer-authenticated requests
//! - [`CloudCollector`]: retries, device filtering and OAuth alert handling

mod api;
mod auth;
mod collector;

pub use api::{Capability, CloudApi, CloudDevice, DEVICES_PATH, DeviceState};
pub use auth::TokenManager;
pub use collector::{CLOUD_COLLECTOR_NAME, CloudCollector, state_reading};
