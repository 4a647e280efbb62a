//! Bounded exponential backoff for non-blocking lock retries.

use std::time::Duration;

/// Backoff schedule injected into the multi-reader strategy's
/// SHARED→RESERVED retry loop.
///
/// The delay starts at `initial` and doubles per attempt up to `max`. The
/// policy only computes delays; the caller decides when to stop retrying
/// (the strategy fails fast as soon as a confirmed reservation holder is
/// observed), which keeps the schedule testable without real time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay.
    pub initial: Duration,
    /// Delay ceiling.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}
