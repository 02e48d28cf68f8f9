//! Exponential backoff for callers wrapping task submission.
//!
//! Not consumed by the pool itself: callers reset it before a run, call
//! [`ExponentialBackoff::sleep`] between attempts, and get an error once the
//! attempt budget is spent. The delay grows as `factor^attempt`, is reduced
//! by the time already elapsed since the previous attempt, and is clamped to
//! the configured bounds.

use crate::error::{ForkpoolError, Result};
use crate::fork::with_process_rng;
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};

/// Jitter strategy applied to the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Always sleep the computed delay.
    #[default]
    None,
    /// Sleep a random duration in `[0, computed_delay]`.
    Full,
}

/// Attempt-tracking exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    factor: f64,
    min_sleep: Duration,
    max_sleep: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            factor: 1.05,
            min_sleep: Duration::from_millis(10),
            max_sleep: Duration::from_millis(5000),
            max_attempts: None,
            jitter: Jitter::None,
            attempts: 0,
            last_attempt: None,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the growth factor (delay grows as `factor^attempt`).
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Override the clamp bounds for a single sleep.
    pub fn with_bounds(mut self, min_sleep: Duration, max_sleep: Duration) -> Self {
        self.min_sleep = min_sleep;
        self.max_sleep = max_sleep;
        self
    }

    /// Limit the number of attempts; `sleep` errors past the limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the jitter strategy (defaults to none).
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Start a fresh attempt sequence.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = Some(Instant::now());
    }

    /// Block for the next attempt's delay.
    ///
    /// Errors with [`ForkpoolError::BackoffExhausted`] once the configured
    /// attempt budget is exceeded.
    pub fn sleep(&mut self) -> Result<()> {
        self.attempts += 1;
        if let Some(max) = self.max_attempts
            && self.attempts > max
        {
            return Err(ForkpoolError::BackoffExhausted {
                attempts: self.attempts,
            });
        }

        thread::sleep(self.sleep_duration());
        self.last_attempt = Some(Instant::now());
        Ok(())
    }

    /// Number of attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempts
    }

    /// The delay the next `sleep` would use, before jitter.
    pub fn sleep_duration(&self) -> Duration {
        let raw_ms = self.min_sleep.as_millis() as f64 + self.factor.powi(self.attempts as i32);
        let since_ms = self
            .last_attempt
            .map(|at| at.elapsed().as_millis() as f64)
            .unwrap_or(0.0);

        let clamped_ms = (raw_ms - since_ms)
            .clamp(self.min_sleep.as_millis() as f64, self.max_sleep.as_millis() as f64);

        let final_ms = match self.jitter {
            Jitter::None => clamped_ms,
            Jitter::Full => with_process_rng(|rng| rng.gen_range(0.0..=clamped_ms)),
        };
        Duration::from_millis(final_ms as u64)
    }
}
