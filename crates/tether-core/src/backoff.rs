//! Exponential backoff
//!
//! `base * 2^attempt`, capped at `max`. Shared by stream restarts and
//! discovery rounds.

use std::time::Duration;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 * base overflows well past any sensible cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
