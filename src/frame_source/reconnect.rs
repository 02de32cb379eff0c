//! Reconnect policy (capped exponential backoff)

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects allowed without a valid frame in between
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Outcome of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter { attempt: u32, delay: Duration },
    GiveUp,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what to do given the number of reconnects already made.
    pub fn next(&self, reconnects_so_far: u32) -> ReconnectDecision {
        if reconnects_so_far >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        let attempt = reconnects_so_far + 1;
        ReconnectDecision::RetryAfter {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}
