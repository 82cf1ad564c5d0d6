//! Exponential backoff for transient coordination-store failures.
//!
//! Delays double from `base` up to `max`, with up to 25% random jitter so
//! that many workers losing the store at once do not reconnect in lockstep.

use std::time::Duration;

use rand::RngExt;

/// Default first delay.
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default upper bound on a single delay.
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff state for one retrying loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, without jitter.
    pub fn current_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Returns the delay to wait now and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        (delay + Duration::from_millis(jitter)).min(self.max)
    }

    /// Number of consecutive failures recorded.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Resets after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
