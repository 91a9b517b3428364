use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay: base, 2*base, 4*base, ... capped at max.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    reset_after: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            max: config.max,
            reset_after: config.reset_after,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the curve.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Reset only if the session that just ended was up for at least `reset_after`.
    pub fn session_ended(&mut self, connected_for: Duration) {
        if connected_for >= self.reset_after {
            self.reset();
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
