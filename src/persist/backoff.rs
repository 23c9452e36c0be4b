use std::time::Duration;

use rand::Rng;

use crate::config::PersistConfig;

/// Exponential backoff with a cap and symmetric random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &PersistConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.jitter,
        )
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        nominal.mul_f64(factor).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.2)
    }
}
