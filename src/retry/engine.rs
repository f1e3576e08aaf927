//! Retry executor, retry events and observers.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use super::classify::{Classify, ErrorKind};
use super::policy::RetryPolicy;

/// Result of a single attempt within a retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RetryOutcome {
    /// The operation returned a value.
    Succeeded,
    /// The attempt failed transiently; another attempt follows after a delay.
    Retrying,
    /// The attempt failed transiently and no attempts remain.
    Exhausted,
    /// The attempt failed with a non-retryable error.
    Aborted,
}

/// One attempt within a retry sequence.
///
/// Emitted to the configured [`RetryObserver`] before the engine sleeps or
/// returns. Never persisted to the database.
#[derive(Debug, Clone, Serialize)]
pub struct RetryEvent {
    /// Operation name supplied by the caller.
    pub operation: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Configured attempt budget.
    pub max_attempts: u32,
    /// Backoff delay scheduled after this attempt (retrying attempts only).
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,
    /// Classification of the failure, if the attempt failed.
    pub error_kind: Option<ErrorKind>,
    /// Rendered failure, if the attempt failed.
    pub error: Option<String>,
    pub outcome: RetryOutcome,
    /// Time since the first attempt started.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Receives every [`RetryEvent`].
pub trait RetryObserver: Send + Sync {
    fn on_event(&self, event: &RetryEvent);
}

/// Logs retry events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RetryObserver for TracingObserver {
    fn on_event(&self, event: &RetryEvent) {
        let delay_ms = event.delay.map(|d| d.as_millis() as u64);
        let elapsed_ms = event.elapsed.as_millis() as u64;
        let error_kind = event.error_kind.as_ref().map(|k| k.as_ref());

        match event.outcome {
            RetryOutcome::Succeeded if event.attempt > 1 => tracing::info!(
                operation = %event.operation,
                attempt = event.attempt,
                max_attempts = event.max_attempts,
                elapsed_ms,
                outcome = event.outcome.as_ref(),
                "Operation succeeded after retry"
            ),
            RetryOutcome::Succeeded => tracing::debug!(
                operation = %event.operation,
                attempt = event.attempt,
                outcome = event.outcome.as_ref(),
                "Operation succeeded"
            ),
            RetryOutcome::Retrying => tracing::warn!(
                operation = %event.operation,
                attempt = event.attempt,
                max_attempts = event.max_attempts,
                delay_ms,
                error_kind,
                error = event.error.as_deref(),
                outcome = event.outcome.as_ref(),
                "Transient failure, backing off"
            ),
            RetryOutcome::Exhausted | RetryOutcome::Aborted => tracing::error!(
                operation = %event.operation,
                attempt = event.attempt,
                max_attempts = event.max_attempts,
                elapsed_ms,
                error_kind,
                error = event.error.as_deref(),
                outcome = event.outcome.as_ref(),
                "Operation failed"
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RetryEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<RetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drain recorded events.
    pub fn take(&self) -> Vec<RetryEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl RetryObserver for RecordingObserver {
    fn on_event(&self, event: &RetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Terminal failure of a retry sequence.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    #[error("{operation}: gave up after {attempts} attempts in {elapsed:?}: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        kind: ErrorKind,
        source: E,
    },

    /// A permanent or validation failure stopped the sequence early.
    #[error("{operation}: aborted on {kind} error after {attempts} attempt(s): {source}")]
    Aborted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        kind: ErrorKind,
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn operation(&self) -> &str {
        match self {
            Self::Exhausted { operation, .. } | Self::Aborted { operation, .. } => operation,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Exhausted { elapsed, .. } | Self::Aborted { elapsed, .. } => *elapsed,
        }
    }

    /// Classification of the last failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { kind, .. } | Self::Aborted { kind, .. } => *kind,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The last error returned by the operation.
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { source, .. } | Self::Aborted { source, .. } => source,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::Aborted { source, .. } => source,
        }
    }
}

/// Progress of a sequence driven through [`Retrier::step`].
#[derive(Debug, Clone, Default)]
pub struct DeferredRetry {
    attempt: u32,
    started: Option<Instant>,
    previous_delay: Option<Duration>,
    due_at: Option<Instant>,
}

impl DeferredRetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts made so far in the current sequence.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// A sequence has started and not yet finished.
    pub fn in_progress(&self) -> bool {
        self.attempt > 0
    }

    /// The backoff after the last failure has elapsed (always true when idle).
    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at.is_none_or(|due| now >= due)
    }
}

/// Result of one [`Retrier::step`] that did not end the sequence with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    Done(T),
    /// Attempt `attempt` failed transiently; try again after `delay`.
    Retrying { attempt: u32, delay: Duration },
}

/// Exponential-backoff executor.
///
/// Holds no mutable state: clones are cheap and independent sequences may run
/// concurrently from any number of tasks. Async sequences sleep with
/// `tokio::time::sleep`, so a backing-off sequence never blocks other tasks.
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    observer: Arc<dyn RetryObserver>,
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Retrier {
    /// Create an executor that logs events through `tracing`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the event observer.
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` using the error type's default [`Classify`] heuristic.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(operation, |e: &E| e.classify(), op).await
    }

    /// Run `op` with a caller-supplied classifier.
    pub async fn run_with<T, E, F, Fut, C>(
        &self,
        operation: &str,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        C: Fn(&E) -> ErrorKind,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = tokio::time::Instant::now();
        let mut previous_delay = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    self.emit_success(operation, attempt, started.elapsed());
                    return Ok(value);
                }
                Err(err) => {
                    let kind = classify(&err);
                    let elapsed = started.elapsed();
                    match self.on_failure(operation, attempt, kind, &err, elapsed, previous_delay)
                    {
                        Some(delay) => {
                            previous_delay = Some(delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(terminal(operation, attempt, elapsed, kind, err)),
                    }
                }
            }
        }
    }

    /// Run one attempt of a caller-driven sequence.
    ///
    /// Never sleeps. After a transient failure `state` records when the next
    /// attempt is due and the caller comes back once [`DeferredRetry::is_due`]
    /// holds. Attempt counting, backoff and events match [`run_with`](Self::run_with).
    pub fn step<T, E, F, C>(
        &self,
        operation: &str,
        state: &mut DeferredRetry,
        classify: C,
        op: F,
    ) -> Result<Step<T>, RetryError<E>>
    where
        E: fmt::Display,
        C: Fn(&E) -> ErrorKind,
        F: FnOnce() -> Result<T, E>,
    {
        let started = *state.started.get_or_insert_with(Instant::now);
        state.attempt += 1;
        let attempt = state.attempt;

        match op() {
            Ok(value) => {
                self.emit_success(operation, attempt, started.elapsed());
                *state = DeferredRetry::default();
                Ok(Step::Done(value))
            }
            Err(err) => {
                let kind = classify(&err);
                let elapsed = started.elapsed();
                match self.on_failure(operation, attempt, kind, &err, elapsed, state.previous_delay) {
                    Some(delay) => {
                        state.previous_delay = Some(delay);
                        state.due_at = Some(Instant::now() + delay);
                        Ok(Step::Retrying { attempt, delay })
                    }
                    None => {
                        *state = DeferredRetry::default();
                        Err(terminal(operation, attempt, elapsed, kind, err))
                    }
                }
            }
        }
    }

    fn emit_success(&self, operation: &str, attempt: u32, elapsed: Duration) {
        self.observer.on_event(&RetryEvent {
            operation: operation.to_string(),
            attempt,
            max_attempts: self.policy.max_attempts(),
            delay: None,
            error_kind: None,
            error: None,
            outcome: RetryOutcome::Succeeded,
            elapsed,
            timestamp: Utc::now(),
        });
    }

    /// Record a failed attempt; returns the delay to sleep if another attempt follows.
    fn on_failure<E: fmt::Display>(
        &self,
        operation: &str,
        attempt: u32,
        kind: ErrorKind,
        err: &E,
        elapsed: Duration,
        previous_delay: Option<Duration>,
    ) -> Option<Duration> {
        let (outcome, delay) = if !kind.is_retryable() {
            (RetryOutcome::Aborted, None)
        } else if attempt >= self.policy.max_attempts() {
            (RetryOutcome::Exhausted, None)
        } else {
            let delay = self.policy.delay_for(attempt, previous_delay);
            (RetryOutcome::Retrying, Some(delay))
        };

        self.observer.on_event(&RetryEvent {
            operation: operation.to_string(),
            attempt,
            max_attempts: self.policy.max_attempts(),
            delay,
            error_kind: Some(kind),
            error: Some(err.to_string()),
            outcome,
            elapsed,
            timestamp: Utc::now(),
        });

        delay
    }
}

fn terminal<E>(
    operation: &str,
    attempts: u32,
    elapsed: Duration,
    kind: ErrorKind,
    source: E,
) -> RetryError<E> {
    let operation = operation.to_string();
    if kind.is_retryable() {
        RetryError::Exhausted {
            operation,
            attempts,
            elapsed,
            kind,
            source,
        }
    } else {
        RetryError::Aborted {
            operation,
            attempts,
            elapsed,
            kind,
            source,
        }
    }
}
