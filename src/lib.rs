//! Sensorium - Reliable Sensor Collection
//!
//! Collects temperature, humidity and air-quality readings from a local
//! bridge and a cloud OAuth service into an embedded SQLite database. It can
//! be used as a library, or run as a standalone binary with the `sensorium`
//! executable.
//!
//! # Architecture
//!
//! - **Retry**: Classified retries with exponential backoff for every fallible call
//! - **Storage**: SQLite in WAL mode, one row per device and second
//! - **Collectors**: Local bridge and cloud OAuth collectors on a shared scheduler
//! - **Alert**: On-disk marker raised when cloud credentials are revoked
//! - **Health**: Deployment validators with 0/1/2 exit codes
//! - **Logging**: `tracing` with a size-bounded rotating log file
//! - **Perf**: Cycle timing, payload size and a JSON baseline
//!
//! # Example
//!
//! ```rust,no_run
//! use sensorium::{AppConfig, HealthChecker, StorageBuilder};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("config/sensorium.yaml")?;
//! let store = StorageBuilder::from_config(&config.database)?.build().await?;
//! println!("{} readings stored", store.count_readings().await?);
//!
//! let report = HealthChecker::standard("config/sensorium.yaml", &config).run().await;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod alert;
pub mod collector;
pub mod config;
pub mod health;
pub mod logging;
pub mod perf;
pub mod retry;
pub mod storage;

pub use alert::{AlertFile, Notifier, OAuthAlert};
pub use collector::{Collector, CollectorError, CollectorRegistry, CycleReport};
pub use config::{AppConfig, ConfigError, Secrets};
pub use health::{CheckStatus, HealthChecker, HealthReport};
pub use perf::{BaselineStore, Comparison, PerformanceMetric};
pub use retry::{Retrier, RetryError, RetryPolicy};
pub use storage::{Reading, ReadingStore, StorageBuilder, StorageError};
