//! Size-triggered log file rotation.
//!
//! [`LogRotationManager`] is a [`MakeWriter`] for `tracing-subscriber`. All
//! clones share one mutex-protected active file. Each formatted record is a
//! single `write` call, and rotation runs under the same lock before a record
//! that would push the active file past `max_bytes`, so no record is ever
//! written into a file that has already been renamed.
//!
//! Failed rotations are retried without sleeping: the backoff only sets when
//! the next write may try again, and writes in between go to the current file.
//!
//! Rotation never logs through `tracing`: the subscriber that would receive
//! the event is the one holding the lock. Diagnostics about a file that was
//! not rotated are appended to it and copied to stderr; anything else goes to
//! stderr only, so a fresh file holds nothing but records.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;

use super::disk::{DiskSpace, FsDiskSpace};
use crate::config::{
    DEFAULT_LOG_BACKUP_COUNT, DEFAULT_LOG_MAX_BYTES, DEFAULT_MIN_FREE_BYTES, LoggingConfig,
};
use crate::retry::{
    Classify, DeferredRetry, RecordingObserver, Retrier, RetryObserver, RetryOutcome, RetryPolicy,
    Step,
};

/// Pause between rotation attempts after a skipped or failed rotation.
pub const DEFAULT_ROTATION_COOLDOWN: Duration = Duration::from_secs(60);

const ROTATION_OPERATION: &str = "log_rotation";

/// Errors raised while setting up logging.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid log rotation config: {0}")]
    Config(String),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Runtime rotation settings.
#[derive(Debug, Clone)]
pub struct LogRotationConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_bytes: u64,
    pub backup_count: u32,
    pub min_free_bytes: u64,
    /// Backoff for filesystem errors while rotating.
    pub retry: RetryPolicy,
    pub cooldown: Duration,
}

impl LogRotationConfig {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backup_count: DEFAULT_LOG_BACKUP_COUNT,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            retry: RetryPolicy::default(),
            cooldown: DEFAULT_ROTATION_COOLDOWN,
        }
    }

    /// Runtime settings from the `logging` config section.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, RotationError> {
        config
            .validate()
            .map_err(|e| RotationError::Config(e.to_string()))?;
        let retry = config
            .retry
            .policy()
            .map_err(|e| RotationError::Config(format!("logging.retry: {e}")))?;

        Ok(Self {
            dir: config.dir.clone(),
            file_name: config.file_name.clone(),
            max_bytes: config.max_bytes,
            backup_count: config.backup_count,
            min_free_bytes: config.min_free_bytes,
            retry,
            cooldown: DEFAULT_ROTATION_COOLDOWN,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_backup_count(mut self, backup_count: u32) -> Self {
        self.backup_count = backup_count;
        self
    }

    pub fn with_min_free_bytes(mut self, min_free_bytes: u64) -> Self {
        self.min_free_bytes = min_free_bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// The file currently being written.
    pub fn active_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Backup `index`; 1 is the newest.
    pub fn backup_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.file_name, index))
    }

    /// Total footprint bound, `max_bytes * (backup_count + 1)`.
    ///
    /// Holds while rotation succeeds and no single record exceeds `max_bytes`.
    pub fn footprint_bound(&self) -> u64 {
        self.max_bytes
            .saturating_mul(u64::from(self.backup_count) + 1)
    }
}

/// Snapshot of the rotation bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationStatus {
    pub active_bytes: u64,
    /// Backups currently on disk.
    pub backup_count: u32,
    pub backup_bytes: u64,
    pub total_bytes: u64,
    pub rotations: u64,
    pub failed_rotations: u64,
    pub skipped_low_disk: u64,
}

struct ActiveFile {
    file: File,
    written: u64,
    rotations: u64,
    failed_rotations: u64,
    skipped_low_disk: u64,
    hold_until: Option<Instant>,
    retry: DeferredRetry,
}

struct Shared {
    config: LogRotationConfig,
    disk: Box<dyn DiskSpace>,
    retrier: Retrier,
    events: Arc<RecordingObserver>,
    active: Mutex<ActiveFile>,
}

/// Rotating log file shared by every writer in the process.
#[derive(Clone)]
pub struct LogRotationManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for LogRotationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRotationManager")
            .field("path", &self.shared.config.active_path())
            .field("max_bytes", &self.shared.config.max_bytes)
            .field("backup_count", &self.shared.config.backup_count)
            .finish_non_exhaustive()
    }
}

fn open_active(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl LogRotationManager {
    /// Open (or create) the active log file.
    pub fn open(config: LogRotationConfig) -> Result<Self, RotationError> {
        Self::with_disk_space(config, FsDiskSpace)
    }

    /// Open with a custom free-space source.
    pub fn with_disk_space(
        config: LogRotationConfig,
        disk: impl DiskSpace,
    ) -> Result<Self, RotationError> {
        if config.max_bytes == 0 {
            return Err(RotationError::Config("max_bytes must be positive".into()));
        }
        if config.backup_count == 0 {
            return Err(RotationError::Config(
                "backup_count must be at least 1".into(),
            ));
        }

        fs::create_dir_all(&config.dir)?;
        let file = open_active(&config.active_path())?;
        let written = file.metadata()?.len();

        let events = Arc::new(RecordingObserver::new());
        let observer: Arc<dyn RetryObserver> = events.clone();
        let retrier = Retrier::new(config.retry.clone()).with_observer(observer);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                disk: Box::new(disk),
                retrier,
                events,
                active: Mutex::new(ActiveFile {
                    file,
                    written,
                    rotations: 0,
                    failed_rotations: 0,
                    skipped_low_disk: 0,
                    hold_until: None,
                    retry: DeferredRetry::new(),
                }),
            }),
        })
    }

    pub fn config(&self) -> &LogRotationConfig {
        &self.shared.config
    }

    /// Path of the active log file.
    pub fn path(&self) -> PathBuf {
        self.shared.config.active_path()
    }

    /// Current sizes and counters, read from disk.
    pub fn status(&self) -> RotationStatus {
        let config = &self.shared.config;
        let active = self.shared.lock();

        let active_bytes = fs::metadata(config.active_path())
            .map(|m| m.len())
            .unwrap_or(active.written);

        let mut backup_count = 0;
        let mut backup_bytes = 0;
        for index in 1..=config.backup_count {
            if let Ok(meta) = fs::metadata(config.backup_path(index))
                && meta.is_file()
            {
                backup_count += 1;
                backup_bytes += meta.len();
            }
        }

        RotationStatus {
            active_bytes,
            backup_count,
            backup_bytes,
            total_bytes: active_bytes + backup_bytes,
            rotations: active.rotations,
            failed_rotations: active.failed_rotations,
            skipped_low_disk: active.skipped_low_disk,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ActiveFile> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_record(&self, buf: &[u8]) -> io::Result<usize> {
        let mut active = self.lock();
        let len = buf.len() as u64;

        if active.written > 0 && active.written.saturating_add(len) > self.config.max_bytes {
            self.rotate(&mut active);
        }

        active.file.write_all(buf)?;
        active.written += len;
        Ok(buf.len())
    }

    /// Rotate unless held off by a recent skip, a failed sequence or a pending
    /// backoff. Never fails and never sleeps: on any problem the current file
    /// stays active.
    fn rotate(&self, active: &mut ActiveFile) {
        let now = Instant::now();
        if let Some(until) = active.hold_until {
            if now < until {
                return;
            }
            active.hold_until = None;
        }
        if !active.retry.is_due(now) {
            return;
        }

        if !active.retry.in_progress() {
            match self.disk.available_bytes(&self.config.dir) {
                Ok(available) if available < self.config.min_free_bytes => {
                    active.skipped_low_disk += 1;
                    active.hold_until = Some(now + self.config.cooldown);
                    self.diagnostic(
                        active,
                        "WARN",
                        format_args!(
                            "low disk space: {available} bytes free, {} required; \
                             skipping rotation and continuing with current file",
                            self.config.min_free_bytes
                        ),
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.report(
                        "WARN",
                        format_args!("could not determine free disk space ({e}); rotating anyway"),
                    );
                }
            }
        }

        let mut retry = std::mem::take(&mut active.retry);
        let result = self.retrier.step(
            ROTATION_OPERATION,
            &mut retry,
            <io::Error as Classify>::classify,
            || self.shift_files(active),
        );
        active.retry = retry;

        for event in self.events.take() {
            if event.outcome == RetryOutcome::Retrying {
                self.diagnostic(
                    active,
                    "WARN",
                    format_args!(
                        "rotation attempt {}/{} failed: {}; next attempt in {:?}, \
                         continuing with current file",
                        event.attempt,
                        event.max_attempts,
                        event.error.as_deref().unwrap_or("unknown error"),
                        event.delay.unwrap_or_default()
                    ),
                );
            }
        }

        match result {
            Ok(Step::Done(())) => active.rotations += 1,
            Ok(Step::Retrying { .. }) => {}
            Err(err) => {
                active.failed_rotations += 1;
                active.hold_until = Some(Instant::now() + self.config.cooldown);
                self.diagnostic(
                    active,
                    "ERROR",
                    format_args!(
                        "severity=critical log rotation failed after {} attempt(s) in {:?}: {}; \
                         continuing with current file",
                        err.attempts(),
                        err.elapsed(),
                        err.last_error()
                    ),
                );
            }
        }
    }

    /// Drop the oldest backup, shift the rest up by one and start a fresh file.
    ///
    /// Each step checks for existence first so a retried attempt resumes
    /// where the failed one stopped.
    fn shift_files(&self, active: &mut ActiveFile) -> io::Result<()> {
        let config = &self.config;

        let oldest = config.backup_path(config.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for index in (1..config.backup_count).rev() {
            let from = config.backup_path(index);
            if from.exists() {
                fs::rename(&from, config.backup_path(index + 1))?;
            }
        }

        active.file.flush()?;
        let current = config.active_path();
        if current.exists() {
            fs::rename(&current, config.backup_path(1))?;
        }

        active.file = open_active(&current)?;
        active.written = 0;
        Ok(())
    }

    /// Append to the active file (counted against its size) and copy to stderr.
    fn diagnostic(&self, active: &mut ActiveFile, level: &str, message: fmt::Arguments<'_>) {
        let line = self.report(level, message);
        if active.file.write_all(line.as_bytes()).is_ok() {
            active.written += line.len() as u64;
        }
    }

    fn report(&self, level: &str, message: fmt::Arguments<'_>) -> String {
        let line = format!(
            "{} {level:>5} sensorium::logging::rotation: {message} path={}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            self.config.active_path().display()
        );
        let _ = io::stderr().write_all(line.as_bytes());
        line
    }
}

/// Writer handed out per record by [`LogRotationManager`].
pub struct RotatingWriter<'a> {
    shared: &'a Shared,
}

impl Write for RotatingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogRotationManager {
    type Writer = RotatingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter {
            shared: &self.shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::FixedDiskSpace;
    use tempfile::tempdir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0).unwrap()
    }

    fn config(dir: &Path, max_bytes: u64, backups: u32) -> LogRotationConfig {
        LogRotationConfig::new(dir, "app.log")
            .with_max_bytes(max_bytes)
            .with_backup_count(backups)
            .with_min_free_bytes(0)
            .with_retry(fast_retry())
            .with_cooldown(Duration::ZERO)
    }

    fn write_line(manager: &LogRotationManager, line: &str) {
        manager.make_writer().write_all(line.as_bytes()).unwrap();
    }

    fn count_lines(path: &Path) -> usize {
        fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn test_footprint_stays_bounded() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 100, 3);
        let bound = config.footprint_bound();
        let manager = LogRotationManager::open(config.clone()).unwrap();

        for i in 0..500 {
            write_line(&manager, &format!("record number {i:05} padding\n"));
            assert!(manager.status().total_bytes <= bound);
        }

        let status = manager.status();
        assert_eq!(status.backup_count, 3);
        assert!(status.rotations > 0);
        assert_eq!(status.failed_rotations, 0);
        assert!(status.active_bytes <= 100);
        assert!(!config.backup_path(4).exists());
    }

    #[test]
    fn test_low_disk_skips_rotation() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 100, 3)
            .with_min_free_bytes(1_000_000)
            .with_cooldown(DEFAULT_ROTATION_COOLDOWN);
        let manager =
            LogRotationManager::with_disk_space(config.clone(), FixedDiskSpace(1_000)).unwrap();

        for i in 0..20 {
            write_line(&manager, &format!("line {i:03} over the threshold\n"));
        }

        let status = manager.status();
        assert_eq!(status.rotations, 0);
        assert_eq!(status.skipped_low_disk, 1);
        assert!(status.active_bytes > 100);
        assert!(!config.backup_path(1).exists());

        let content = fs::read_to_string(config.active_path()).unwrap();
        assert!(content.contains("low disk space"));
        assert!(content.contains("line 019"));
    }

    #[test]
    fn test_failed_rotation_keeps_current_file() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 50, 2);
        let manager = LogRotationManager::open(config.clone()).unwrap();

        // The oldest backup slot is a non-empty directory, so it cannot be removed.
        let blocker = config.backup_path(2);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        // Backoff is 1ms then 2ms; each pause lets the next write retry.
        for i in 0..10 {
            write_line(&manager, &format!("entry {i:02} ........\n"));
            std::thread::sleep(Duration::from_millis(10));
        }

        let status = manager.status();
        assert!(status.failed_rotations >= 1);
        assert_eq!(status.rotations, 0);

        let content = fs::read_to_string(config.active_path()).unwrap();
        for i in 0..10 {
            assert!(content.contains(&format!("entry {i:02}")));
        }
        assert!(content.contains("log rotation failed after 3 attempt(s)"));
        assert!(content.contains("rotation attempt 1/3 failed"));

        // Once the obstruction is gone the next write rotates normally.
        fs::remove_dir_all(&blocker).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        write_line(&manager, "after recovery\n");
        let status = manager.status();
        assert_eq!(status.rotations, 1);
        assert!(config.backup_path(1).exists());
        assert_eq!(
            fs::read_to_string(config.active_path()).unwrap(),
            "after recovery\n"
        );
    }

    #[test]
    fn test_failed_rotation_never_stalls_other_writers() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 50, 2)
            .with_retry(RetryPolicy::new(3, Duration::from_secs(1), 2.0).unwrap());
        fs::write(config.active_path(), "x".repeat(45)).unwrap();
        let manager = LogRotationManager::open(config.clone()).unwrap();

        let blocker = config.backup_path(2);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        let started = Instant::now();
        let trigger = {
            let manager = manager.clone();
            std::thread::spawn(move || write_line(&manager, "triggers!\n"))
        };
        let other = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let began = Instant::now();
                write_line(&manager, "other\n");
                began.elapsed()
            })
        };
        trigger.join().unwrap();
        let other_wait = other.join().unwrap();

        assert!(other_wait < Duration::from_millis(500), "{other_wait:?}");
        assert!(started.elapsed() < Duration::from_millis(500));

        // Still inside the backoff window: no further attempt, nothing lost.
        write_line(&manager, "later\n");
        let status = manager.status();
        assert_eq!(status.rotations, 0);
        assert_eq!(status.failed_rotations, 0);

        let content = fs::read_to_string(config.active_path()).unwrap();
        assert_eq!(content.matches("rotation attempt").count(), 1);
        assert!(content.contains("rotation attempt 1/3 failed"));
        assert!(content.contains("triggers!"));
        assert!(content.contains("other"));
        assert!(content.contains("later"));
    }

    #[test]
    fn test_fresh_file_holds_only_records() {
        struct UnknownDiskSpace;
        impl DiskSpace for UnknownDiskSpace {
            fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
                Err(io::Error::other("statfs unavailable"))
            }
        }

        let dir = tempdir().unwrap();
        let config = config(dir.path(), 60, 2);
        let manager = LogRotationManager::with_disk_space(config.clone(), UnknownDiskSpace).unwrap();

        for i in 0..20 {
            write_line(&manager, &format!("record {i:02} .........\n"));
            let status = manager.status();
            assert!(status.active_bytes <= 60, "{status:?}");
        }

        let status = manager.status();
        assert!(status.rotations > 0);
        for index in 1..=status.backup_count {
            let backup = fs::read_to_string(config.backup_path(index)).unwrap();
            assert!(backup.len() <= 60);
            assert!(!backup.contains("free disk space"));
        }
    }

    #[test]
    fn test_reopen_counts_existing_bytes() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 40, 2);
        fs::write(config.active_path(), "x".repeat(35)).unwrap();

        let manager = LogRotationManager::open(config.clone()).unwrap();
        write_line(&manager, "0123456789\n");

        assert_eq!(manager.status().rotations, 1);
        assert_eq!(fs::read_to_string(config.backup_path(1)).unwrap().len(), 35);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 256, 1000);
        let manager = LogRotationManager::open(config.clone()).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        write_line(&manager, &format!("thread {t} record {i}\n"));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let status = manager.status();
        assert!(status.rotations > 0);

        let mut lines = count_lines(&config.active_path());
        for index in 1..=status.backup_count {
            lines += count_lines(&config.backup_path(index));
        }
        assert_eq!(lines, 800);
    }

    #[test]
    fn test_works_as_tracing_writer() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 1024 * 1024, 2);
        let manager = LogRotationManager::open(config.clone()).unwrap();

        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(manager.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(device_id = "hue:sensor1", "reading stored");
        });

        let content = fs::read_to_string(config.active_path()).unwrap();
        assert!(content.contains("reading stored"));
        assert!(content.contains("hue:sensor1"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        assert!(LogRotationManager::open(config(dir.path(), 0, 1)).is_err());
        assert!(LogRotationManager::open(config(dir.path(), 10, 0)).is_err());
    }
}
