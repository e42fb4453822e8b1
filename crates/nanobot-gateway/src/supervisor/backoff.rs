use std::time::Duration;

use nanobot_config::RestartPolicyConfig;

/// Exponential restart delay: `base * 2^attempt`, capped at `max`.
///
/// The attempt counter only goes back to zero after a bridge has stayed
/// ready for `reset_after`, so a bridge that crashes shortly after every
/// start keeps backing off.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    reset_after: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &RestartPolicyConfig) -> Self {
        Self {
            base: policy.base_delay(),
            max: policy.max_delay(),
            reset_after: policy.reset_after(),
            attempt: 0,
        }
    }

    /// Delay before the next restart. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = 1u32
            .checked_shl(self.attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset once the bridge has been ready long enough. Returns whether it did.
    pub fn note_ready_for(&mut self, uptime: Duration) -> bool {
        if self.attempt > 0 && uptime >= self.reset_after {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Restarts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
