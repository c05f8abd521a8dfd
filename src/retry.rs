//! Retry policy: exponential backoff with jitter and failure classification.
//!
//! Pure decision logic, no broker I/O. The runtime asks two questions per
//! failed delivery: "should this task be retried?" and "after how long?".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Error-message fragments that never earn a retry, matched
/// case-insensitively against [`TaskError::message`].
pub const NON_RETRYABLE_PATTERNS: [&str; 4] = [
    "authentication failed",
    "permission denied",
    "not found",
    "invalid parameter",
];

/// Upper bound for the exponent so `powi` cannot blow up to infinity.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Milliseconds of uniform random jitter added to every delay.
const JITTER_MS: u64 = 1000;

/// Backoff and retry-budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// How many retries a task may consume before it is dead-lettered
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
    /// Ceiling for the computed delay, in milliseconds (jitter excluded)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Standard exponential backoff.
    pub fn exponential(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_factor: 2.0,
            max_delay_ms,
        }
    }

    /// Never retry: every failure is terminal.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before the next attempt for a task that has already consumed
    /// `retry_count` retries, with jitter applied.
    ///
    /// `min(initial_delay * backoff_factor^retry_count, max_delay)` plus a
    /// uniform random 0..1000 ms so simultaneous failures do not thunder
    /// back in lockstep.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let base = self.delay_without_jitter(retry_count);
        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        base + Duration::from_millis(jitter)
    }

    /// The nominal delay for `retry_count`, without jitter. Deterministic,
    /// useful for displaying schedules and for tests.
    pub fn delay_without_jitter(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(MAX_BACKOFF_EXPONENT) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Whether a failed task gets another attempt.
    ///
    /// `false` when the retry budget is exhausted or the error message
    /// matches one of [`NON_RETRYABLE_PATTERNS`]; `true` otherwise. The
    /// handler's own permanence verdict is checked separately by the
    /// runtime.
    pub fn should_retry(&self, error: &TaskError, retry_count: u32) -> bool {
        if retry_count >= self.max_retries {
            return false;
        }
        let message = error.message().to_lowercase();
        !NON_RETRYABLE_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}
