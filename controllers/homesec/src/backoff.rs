//! # Exponential Backoff
//!
//! Provides the per-key retry delay used by the work queue after a failed
//! reconciliation.
//!
//! The delay doubles with every consecutive failure and is capped.
//! Defaults: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).

use std::time::Duration;

/// Exponential backoff calculator
///
/// Generates backoff durations that double on every call, starting from `base`
/// and never exceeding `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (for reset)
    base: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given base and maximum delays
    ///
    /// # Arguments
    ///
    /// * `base` - Delay after the first failure (typically 5s)
    /// * `max` - Upper bound on any delay (typically 5m)
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }

    /// Calculate the backoff duration for a given error count (stateless)
    ///
    /// `error_count` is 0-indexed: the first failure waits `base`, the second
    /// `base * 2`, and so on, capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        // 2^31 already overflows any realistic cap
        let factor = 1u32.checked_shl(error_count.min(31)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max)
    }
}
