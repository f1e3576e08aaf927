//! Collector Layer
//!
//! Collectors fetch readings from vendor APIs, validate them and hand them to
//! the [`ReadingStore`](crate::storage::ReadingStore). Every outbound call goes
//! through the retry engine; each collector decides what a permanent failure
//! means for it.
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait; `run_cycle` ties discovery, collection,
//!   validation and storage together
//! - [`Schedule`]: Execution schedule (interval or cron)
//! - [`CollectorRegistry`]: One independent scheduler job per collector,
//!   with graceful shutdown
//! - [`bridge`]: Local bridge collector (username-in-path REST)
//! - [`cloud`]: Cloud collector (OAuth refresh token, alert marker)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensorium::collector::{CollectorRegistry, bridge::BridgeCollector};
//! use sensorium::config::{BridgeConfig, Secrets};
//! use sensorium::retry::RetryPolicy;
//! use sensorium::storage::StorageBuilder;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageBuilder::new("data/readings.db").build().await?;
//! let secrets = Secrets::load("config/secrets.yaml")?;
//! let bridge = BridgeCollector::new(
//!     &BridgeConfig::new("http://192.168.1.2"),
//!     secrets.bridge.as_ref().ok_or("bridge secrets missing")?,
//!     RetryPolicy::default(),
//!     store,
//! )?;
//!
//! let registry = CollectorRegistry::new().await?;
//! registry.spawn(Arc::new(bridge)).await?;
//! registry.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cloud;
mod registry;
mod traits;
mod validation;

pub use registry::{CollectorRegistry, DEFAULT_SHUTDOWN_TIMEOUT, JobInfo};
pub use traits::{Collector, CollectorError, CycleReport, Device, MIN_INTERVAL, Schedule};
pub use validation::{ValidationError, plausible_range, validate_reading, validate_reading_at};
