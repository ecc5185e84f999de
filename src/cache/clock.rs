//! Time source for entry timestamps and expiry checks

use crate::cache::types::Millis;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of "now" in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Millis;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for simulating elapsed time
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Start at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_millis())
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Millis) {
        self.now.store(to, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_millis(), 61_000);

        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn test_system_clock_is_recent() {
        let now = SystemClock.now_millis();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }
}
