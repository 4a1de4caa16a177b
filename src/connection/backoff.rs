//! Reconnect delay policy.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Jitter {
    /// Always return the capped exponential delay.
    None,
    /// Shave up to this fraction (0.0 - 1.0) off each delay at random.
    Proportional(f64),
}

/// Exponential backoff with a cap.
///
/// Delays never decrease between consecutive failures and never exceed the
/// cap, with or without jitter. There is no attempt limit; callers stop
/// retrying on shutdown.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    attempt: u32,
    last_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: Jitter::None,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        // capped_ms = min(base * 2^attempt, max_delay)
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        let jittered_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Proportional(fraction) => {
                let spread = (capped_ms as f64 * fraction.clamp(0.0, 1.0)) as u64;
                let cut = if spread == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=spread)
                };
                capped_ms.saturating_sub(cut as u128)
            }
        };

        let delay = Duration::from_millis(jittered_ms.min(u64::MAX as u128) as u64)
            .max(self.last_delay)
            .min(self.max_delay);

        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}
