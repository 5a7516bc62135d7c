//! Backoff policy for inline chunk retries.
//!
//! `delay = min(max_delay, base * 2^attempt + random(0, jitter))`

use std::time::Duration;

use rand::Rng;

use pulse_common::config::PushConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total send attempts per chunk, the first one included.
    pub max_attempts: u32,
    pub base: Duration,
    pub jitter: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PushConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &PushConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Whether another attempt is allowed after `attempts_made` sends.
    pub const fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-indexed), ignoring jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, Duration::ZERO)
    }

    /// Delay before retry number `attempt` with an explicit jitter sample.
    ///
    /// Pure; the sample is clamped to the configured jitter.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_sample: Duration) -> Duration {
        let base_ms = millis(self.base);
        let cap_ms = millis(self.max_delay);

        let exponential = if attempt >= 63 {
            u64::MAX
        } else {
            base_ms.saturating_mul(1u64 << attempt)
        };

        let jitter_ms = millis(jitter_sample.min(self.jitter));
        Duration::from_millis(exponential.saturating_add(jitter_ms).min(cap_ms))
    }

    /// Delay before retry number `attempt` with a fresh random jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = millis(self.jitter);
        let sample = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(sample))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
