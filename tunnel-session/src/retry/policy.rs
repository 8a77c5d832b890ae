//! Reconnect backoff policy

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff for reconnection attempts
///
/// The delay doubles from `initial_delay` up to `max_delay`. The policy
/// only computes delays; the controller does the waiting.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// - `initial_delay`: delay before the first retry
    /// - `max_delay`: ceiling for the doubling delay
    /// - `max_attempts`: consecutive attempts before giving up, `None` for unlimited
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay, config.max_attempts)
    }

    /// Record another attempt and get its number and delay
    ///
    /// Returns `None` once the attempt cap is exceeded.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        let attempt = self.attempts.saturating_add(1);
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        self.attempts = attempt;
        Some((attempt, self.delay_for(attempt)))
    }

    /// Delay for a given 1-based attempt number
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
