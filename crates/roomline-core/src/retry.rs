use std::time::Duration;

/// Exponential delay schedule between subscription re-acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u64 << attempt.min(20);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(multiplier)
                .min(self.max_delay_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Attempt counter over a [`RetryPolicy`]; reset after a successful open.
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
