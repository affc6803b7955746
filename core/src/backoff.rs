use std::time::Duration;

use leaseq_config::CoordSettings;
use rand::Rng;

/// Exponential retry delay with multiplicative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    /// Fraction in `[0, 1)`; the delay is scaled by a factor in `[1-j, 1+j]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&CoordSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &CoordSettings) -> Self {
        Self {
            base_delay_seconds: settings.base_retry_delay_seconds,
            max_delay_seconds: settings.max_retry_delay_seconds,
            jitter_factor: settings.retry_jitter_factor,
        }
    }

    /// Retries go straight back to the ready set.
    pub fn immediate() -> Self {
        Self {
            base_delay_seconds: 0.0,
            max_delay_seconds: 0.0,
            jitter_factor: 0.0,
        }
    }

    /// Un-jittered delay before the retry that follows `attempt` (1-based).
    pub fn backoff_seconds(&self, attempt: i64) -> f64 {
        calculate_backoff_seconds(attempt, self.base_delay_seconds, self.max_delay_seconds)
    }

    pub fn delay_for(&self, attempt: i64) -> Duration {
        let seconds = self.backoff_seconds(attempt);
        if seconds <= 0.0 {
            return Duration::ZERO;
        }
        let jittered = apply_jitter(seconds, self.jitter_factor, &mut rand::rng());
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay_seconds.max(seconds)))
    }
}

fn calculate_backoff_seconds(attempt: i64, base_seconds: f64, max_seconds: f64) -> f64 {
    if base_seconds <= 0.0 {
        return 0.0;
    }
    let exponent = attempt.saturating_sub(1).clamp(0, 62) as i32;
    let delay = base_seconds * 2_f64.powi(exponent);
    delay.min(max_seconds.max(0.0))
}

fn apply_jitter(seconds: f64, jitter_factor: f64, rng: &mut impl Rng) -> f64 {
    let jitter = jitter_factor.clamp(0.0, 0.99);
    if jitter == 0.0 {
        return seconds;
    }
    seconds * rng.random_range((1.0 - jitter)..=(1.0 + jitter))
}

/// Picks a sleep between `0.5 * base` and `1.5 * base` so contending
/// callers do not retry in lockstep.
pub(crate) fn jittered_sleep(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let millis = base.as_millis().max(1) as u64;
    let low = (millis / 2).max(1);
    let high = millis + millis / 2;
    Duration::from_millis(rand::rng().random_range(low..=high))
}
