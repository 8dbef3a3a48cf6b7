//! Retry and circuit-breaker policy for the pipelines.
//!
//! Retry decisions are driven by the structured error kind, not message
//! text: `dependency-failure` and `timeout` back off and retry, `conflict`
//! is resolved by the caller against its idempotency key, everything else
//! is terminal for the work item.

use canton_rs::ErrorKind;
use std::time::Duration;

/// Exponential backoff settings for a pipeline.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a work item is marked failed.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff for a given attempt (0-indexed), capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(backoff_secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether the work item has attempts left. With `max_retries = 0` the
    /// first failure is terminal.
    pub fn attempts_exhausted(&self, attempts: i32) -> bool {
        attempts > self.max_retries as i32
    }
}

/// What to do with a work item after a failed side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; keep the item open and try again later.
    Retry,
    /// The idempotency key was already consumed; the caller decides whether
    /// that means success.
    ResolveConflict,
    /// Terminal for this item.
    Fail,
}

pub fn decide(kind: ErrorKind) -> RetryDecision {
    if kind.is_retryable() {
        RetryDecision::Retry
    } else if kind == ErrorKind::Conflict {
        RetryDecision::ResolveConflict
    } else {
        RetryDecision::Fail
    }
}

/// Pauses a pipeline after a run of consecutive poll-cycle failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    pause: Duration,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, pause: Duration) -> Self {
        Self {
            threshold,
            pause,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed cycle; returns the pause to apply when the breaker
    /// trips (the counter then resets).
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.consecutive_failures = 0;
            Some(self.pause)
        } else {
            None
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn zero_max_retries_is_terminal_on_first_failure() {
        let config = RetryConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.attempts_exhausted(1));
        assert!(!config.attempts_exhausted(0));
    }

    #[test]
    fn decisions_follow_error_kind() {
        assert_eq!(decide(ErrorKind::Dependency), RetryDecision::Retry);
        assert_eq!(decide(ErrorKind::Timeout), RetryDecision::Retry);
        assert_eq!(decide(ErrorKind::Conflict), RetryDecision::ResolveConflict);
        assert_eq!(decide(ErrorKind::InvalidInput), RetryDecision::Fail);
        assert_eq!(decide(ErrorKind::Forbidden), RetryDecision::Fail);
    }

    #[test]
    fn circuit_breaker_trips_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(5));
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), Some(Duration::from_secs(5)));
        // Counter reset after tripping
        assert_eq!(breaker.record_failure(), None);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
