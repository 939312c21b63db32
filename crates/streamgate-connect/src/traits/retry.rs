//! Retry policy for transient connector faults
//!
//! The run loop absorbs `Transient` errors from `produce_next()` with
//! bounded exponential backoff. [`RetryGuard`] counts consecutive failures
//! for the record currently being fetched and is reset by every success.

use std::time::{Duration, Instant};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum consecutive failed calls for one record, the first call included.
    /// The failure that reaches this count is promoted to fatal.
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) spread around the computed delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote the first transient failure straight to fatal
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts (no exponential growth, no jitter)
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failure (1-indexed; 0 means no wait)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // keep powi in range; anything past 30 doublings is capped anyway
        let capped_attempt = attempt.min(30);
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped_attempt as i32 - 1);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        // Deterministic jitter from the golden ratio sequence
        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter_value = (attempt as f64 * 0.618033988749895) % 1.0;
            jitter_range * (jitter_value - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

/// Tracks consecutive failures for the record currently being fetched
#[derive(Debug)]
pub struct RetryGuard {
    config: RetryConfig,
    attempt: u32,
    first_failure: Option<Instant>,
}

impl RetryGuard {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            first_failure: None,
        }
    }

    /// Record a failed call.
    ///
    /// Returns the delay before the next call, or `None` once the failure
    /// count has reached `max_attempts`.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt += 1;
        self.first_failure.get_or_insert_with(Instant::now);

        if self.attempt < self.config.max_attempts {
            Some(self.config.delay_for_attempt(self.attempt))
        } else {
            None
        }
    }

    /// Consecutive failures so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the first failure of the current streak
    pub fn elapsed(&self) -> Duration {
        self.first_failure
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// Clear the streak after a successful call
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.first_failure = None;
    }
}
