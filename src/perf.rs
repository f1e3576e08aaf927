//! Performance Measurement
//!
//! Cycle timing and payload accounting for collectors, plus a small JSON
//! baseline file used to compare a run against the previously captured one.
//! Nothing here influences collection; it only observes it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Errors reading or writing the baseline file.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("baseline I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("baseline file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether the cycle used the optimized (lightweight) data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OptimizationStatus {
    Optimized,
    Fallback,
}

/// One measured collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub collector: String,
    pub duration_ms: u64,
    pub payload_bytes: u64,
    pub optimization: OptimizationStatus,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceMetric {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Per-collector payload counter, shared by every request within a cycle.
#[derive(Debug, Default)]
pub struct PayloadMeter {
    bytes: AtomicU64,
    fallback: AtomicBool,
}

impl PayloadMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a response body.
    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Note that the cycle had to leave the optimized path.
    pub fn mark_fallback(&self) {
        self.fallback.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.fallback.store(false, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> OptimizationStatus {
        if self.fallback.load(Ordering::Relaxed) {
            OptimizationStatus::Fallback
        } else {
            OptimizationStatus::Optimized
        }
    }
}

/// Times one collection cycle.
#[derive(Debug)]
pub struct Stopwatch {
    collector: String,
    started: Instant,
}

impl Stopwatch {
    pub fn start(collector: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop timing and log the measurement.
    pub fn finish(self, payload_bytes: u64, optimization: OptimizationStatus) -> PerformanceMetric {
        let duration_ms = self.started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        tracing::info!(
            collector = %self.collector,
            duration_ms,
            payload_bytes,
            optimization = optimization.as_ref(),
            "Collection cycle measured"
        );
        PerformanceMetric {
            collector: self.collector,
            duration_ms,
            payload_bytes,
            optimization,
            timestamp: Utc::now(),
        }
    }

    /// Stop timing using a meter's accumulated totals.
    pub fn finish_with(self, meter: &PayloadMeter) -> PerformanceMetric {
        self.finish(meter.bytes(), meter.status())
    }
}

/// Relative change between two measurements, in percent (negative is better).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub duration_change_pct: Option<f64>,
    pub payload_change_pct: Option<f64>,
}

fn pct_change(before: u64, after: u64) -> Option<f64> {
    if before == 0 {
        return None;
    }
    Some((after as f64 - before as f64) / before as f64 * 100.0)
}

impl Comparison {
    pub fn between(before: &PerformanceMetric, after: &PerformanceMetric) -> Self {
        Self {
            duration_change_pct: pct_change(before.duration_ms, after.duration_ms),
            payload_change_pct: pct_change(before.payload_bytes, after.payload_bytes),
        }
    }
}

/// Last captured metric per collector.
pub type Baseline = BTreeMap<String, PerformanceMetric>;

/// JSON baseline file.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the baseline; a missing file is an empty baseline.
    pub fn load(&self) -> Result<Baseline, PerfError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Baseline::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the baseline file atomically (write to a sibling, then rename).
    pub fn save(&self, baseline: &Baseline) -> Result<(), PerfError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(baseline)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Replace the entry for `metric.collector`, returning the previous one.
    pub fn record(&self, metric: PerformanceMetric) -> Result<Option<PerformanceMetric>, PerfError> {
        let mut baseline = self.load()?;
        let previous = baseline.insert(metric.collector.clone(), metric);
        self.save(&baseline)?;
        Ok(previous)
    }
}
