//! Millisecond time source used by metrics windows, breaker waits and call timing

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since an arbitrary, fixed origin
    fn now_millis(&self) -> u64;
}

/// Clock anchored to an `Instant` taken at construction.
///
/// Immune to wall-clock adjustments (NTP, DST).
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();

        let t1 = clock.now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = clock.now_millis();

        assert!(t2 >= t1 + 5, "expected {} >= {}", t2, t1 + 5);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);

        clock.advance(250);
        assert_eq!(clock.now_millis(), 350);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
