use std::time::Duration;

use duel_shared::ReconnectConfig;

/// Jittered exponential backoff schedule for one reconnection episode
#[derive(Clone, Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Un-jittered delay before attempt number `attempt` (zero-based)
    pub fn base_delay_for(config: &ReconnectConfig, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        config
            .base_delay
            .saturating_mul(factor)
            .min(config.max_delay)
    }

    /// Delay before the next attempt, or `None` once attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let base = Self::base_delay_for(&self.config, self.attempt);
        self.attempt += 1;

        let spread = (fastrand::f64() * 2.0 - 1.0) * self.config.jitter;
        Some(base.mul_f64((1.0 + spread).max(0.0)))
    }

    /// Longest time a full schedule can take, used by the side that waits
    /// for the dialer to come back
    pub fn total_budget(config: &ReconnectConfig) -> Duration {
        (0..config.max_attempts)
            .map(|attempt| Self::base_delay_for(config, attempt).mul_f64(1.0 + config.jitter))
            .sum()
    }
}
