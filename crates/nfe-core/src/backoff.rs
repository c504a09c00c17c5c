use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with optional additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added at random, in `[0.0, 1.0)`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        // Below 1.0 the jittered delay for attempt n stays under the bare delay for n + 1.
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// `min(max_delay, base_delay * 2^attempt_index)` without jitter.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt) plus up to `jitter * delay`,
    /// still capped at `max_delay`.
    pub fn jittered_delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        (delay + Duration::from_secs_f64(extra)).min(self.max_delay)
    }
}

pub fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = duration.as_millis().min(i64::MAX as u128) as i64;
    chrono::Duration::milliseconds(millis)
}
