//! Logging
//!
//! `tracing` subscriber setup and the size-bounded log file behind it.
//!
//! # Components
//!
//! - [`LogRotationManager`]: rotating file writer (`MakeWriter`) with backup pruning
//! - [`RotationStatus`]: on-demand footprint and counters
//! - [`DiskSpace`]: free-space probe consulted before each rotation
//! - [`init_tracing`]: installs the global subscriber (stderr + rotating file)

mod disk;
mod rotation;

pub use disk::{DiskSpace, FixedDiskSpace, FsDiskSpace};
pub use rotation::{
    DEFAULT_ROTATION_COOLDOWN, LogRotationConfig, LogRotationManager, RotatingWriter,
    RotationError, RotationStatus,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,sensorium=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber: human-readable stderr plus the rotating file.
///
/// Returns the manager so callers can report [`RotationStatus`].
pub fn init_tracing(config: &LoggingConfig) -> Result<LogRotationManager, RotationError> {
    let manager = LogRotationManager::open(LogRotationConfig::from_config(config)?)?;

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(manager.clone()),
        )
        .try_init()
        .map_err(|e| RotationError::Subscriber(e.to_string()))?;

    Ok(manager)
}

/// Install a stderr-only subscriber, for commands that must not touch the log directory.
pub fn init_stderr_tracing() -> Result<(), RotationError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| RotationError::Subscriber(e.to_string()))
}
