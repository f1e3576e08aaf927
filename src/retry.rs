//! Retry Engine
//!
//! Generic exponential-backoff executor shared by every component that talks
//! to something that can fail transiently: collector HTTP calls, SQLite writes
//! under lock contention and log-file rotation.
//!
//! # Components
//!
//! - [`ErrorKind`] / [`Classify`]: tagged transient/permanent/validation
//!   classification with a per-type default heuristic
//! - [`RetryPolicy`]: attempt count, base delay, multiplier, cap and jitter
//! - [`Retrier`]: async executors (`run`, `run_with`) and a non-sleeping
//!   [`step`](Retrier::step) driven through [`DeferredRetry`]
//! - [`RetryEvent`] / [`RetryObserver`]: one event per attempt, logged through
//!   [`TracingObserver`] by default
//! - [`RetryError`]: exhaustion vs. permanent abort, with full diagnostics
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sensorium::retry::{ErrorKind, Retrier, RetryPolicy};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0)?;
//! let retrier = Retrier::new(policy);
//!
//! let body = retrier
//!     .run_with(
//!         "fetch_devices",
//!         |_e: &std::io::Error| ErrorKind::Transient,
//!         || async { Ok::<_, std::io::Error>("[]".to_string()) },
//!     )
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

mod classify;
mod engine;
mod policy;

pub use classify::{Classify, ErrorKind, classify_http_status, classify_reqwest};
pub use engine::{
    DeferredRetry, RecordingObserver, Retrier, RetryError, RetryEvent, RetryObserver,
    RetryOutcome, Step, TracingObserver,
};
pub use policy::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MULTIPLIER, PolicyError, RetryPolicy,
};
