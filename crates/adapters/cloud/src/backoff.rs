//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

const MAX_EXPONENT: u32 = 16;
const MIN_DELAY: Duration = Duration::from_millis(100);

/// Delay sequence `initial * 2^attempt`, capped at `max`, with up to 25%
/// random jitter on top. The jitter still applies at the cap, so clients
/// that hit it together drift apart. Retries never stop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_DELAY);
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, without jitter.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let factor = 1_u32 << self.attempt.min(MAX_EXPONENT);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        base.mul_f64(1.0 + jitter)
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
