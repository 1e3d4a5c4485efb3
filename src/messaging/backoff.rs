//! Retry policy for the initial broker connect.
//!
//! Delays grow exponentially from `base_delay`, are capped at `max_delay`, and
//! carry 50-100% jitter so that replicas restarting together do not hammer the
//! broker in lockstep.

use std::time::Duration;

use crate::types::MessagingConfig;

/// How many times, and how patiently, to attempt a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Double the delay after each failure
    pub exponential_backoff: bool,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_backoff: true,
        }
    }
}

impl ConnectRetry {
    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Backoff sequence for this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retry_count: 0,
        }
    }
}

/// Stateful delay generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ConnectRetry,
    retry_count: u32,
}

impl Backoff {
    /// Delay before the next attempt, without jitter.
    pub fn ceiling(&self) -> Duration {
        if !self.policy.exponential_backoff {
            return self.policy.base_delay.min(self.policy.max_delay);
        }

        let factor = 2u32.saturating_pow(self.retry_count);
        self.policy
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay)
    }

    /// Delay before the next attempt with jitter applied; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.ceiling();
        self.retry_count = self.retry_count.saturating_add(1);

        // Add jitter (50-100% of delay)
        let jitter_factor = 0.5 + (rand::random::<f64>() * 0.5);
        capped.mul_f64(jitter_factor)
    }
}
