//! Backoff policy.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Default attempt count.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Upper bound of the random jitter, as a fraction of the computed delay.
const JITTER_RATIO: f64 = 0.25;

/// Invalid policy parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("base_delay must be greater than zero")]
    ZeroDelay,

    #[error("multiplier must be a finite value >= 1.0, got {0}")]
    Multiplier(f64),
}

/// Exponential backoff parameters.
///
/// The delay after failed attempt `n` (1-based) is
/// `base_delay * multiplier^(n-1)`, optionally capped by `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy without cap or jitter.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if base_delay.is_zero() {
            return Err(PolicyError::ZeroDelay);
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(PolicyError::Multiplier(multiplier));
        }

        Ok(Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: None,
            jitter: false,
        })
    }

    /// Cap every computed delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Add up to 25% random jitter to each delay.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Deterministic delay after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Delay actually slept after `attempt`, never shorter than `previous`.
    pub(crate) fn delay_for(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let mut delay = self.backoff(attempt);

        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
            delay = delay.saturating_add(delay.mul_f64(factor));
        }

        match previous {
            Some(prev) => delay.max(prev),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_rejects_invalid_parameters() {
        assert_eq!(
            RetryPolicy::new(0, Duration::from_secs(1), 2.0),
            Err(PolicyError::ZeroAttempts)
        );
        assert_eq!(
            RetryPolicy::new(3, Duration::ZERO, 2.0),
            Err(PolicyError::ZeroDelay)
        );
        assert!(matches!(
            RetryPolicy::new(3, Duration::from_secs(1), 0.5),
            Err(PolicyError::Multiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::new(3, Duration::from_secs(1), f64::NAN),
            Err(PolicyError::Multiplier(_))
        ));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1), 2.0).unwrap();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), 3.0)
            .unwrap()
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(3));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert_eq!(policy.backoff(9), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_huge_exponent_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), 10.0).unwrap();
        assert_eq!(policy.backoff(10_000), Duration::MAX);
    }

    #[test]
    fn test_jitter_bounds_and_monotonic() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 1.0)
            .unwrap()
            .with_jitter(true);

        let mut previous = None;
        for attempt in 1..5 {
            let delay = policy.delay_for(attempt, previous);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125).max(previous.unwrap_or_default()));
            if let Some(prev) = previous {
                assert!(delay >= prev);
            }
            previous = Some(delay);
        }
    }
}
