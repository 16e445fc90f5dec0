use std::time::Duration;

/// Exponential backoff with jitter, capped at `max`.
///
/// Used between retrieval polls and after failed part uploads so a flaky
/// service is never hammered in a tight loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before attempt number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Delay with up to 25% random jitter added, never exceeding `max` and
    /// never below `min`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base.as_millis() / 4) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::random::<u64>() % spread
        };
        (base + Duration::from_millis(jitter)).clamp(self.min, self.max)
    }
}
