//! Reconnect delay with exponential backoff and jitter.

use crate::config::TransportConfig;
use rand::Rng;
use std::time::Duration;

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: TransportConfig::RECONNECT_BASE_DELAY,
            max_delay: TransportConfig::RECONNECT_MAX_DELAY,
            exponential_base: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean delay while spreading
            // reconnect storms; never drops near zero.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_attempt(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}
