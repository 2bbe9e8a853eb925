//! Windowed success/failure counters feeding the circuit breaker
//!
//! Counters live in a bucket that is swapped for a fresh one once the
//! configured window elapses. Snapshots of `(total, error_percentage)` are
//! cached for `snapshot_ttl_millis`; only the thread that wins the
//! compare-and-swap on the snapshot timestamp recomputes them.
//!
//! Resets are best-effort: an increment racing a reset may land in the bucket
//! being replaced and be lost. The breaker treats the error rate as a
//! statistical signal, so this is accepted.

use crate::clock::Clock;
use crate::config::ConfigSource;
use crate::key::Key;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outcome of a call, as counted by the metrics window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
}

impl OutcomeKind {
    fn index(self) -> usize {
        match self {
            OutcomeKind::Success => 0,
            OutcomeKind::Failure => 1,
        }
    }
}

/// Point-in-time view of a metrics window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub error_percentage: u32,
}

impl MetricsSnapshot {
    /// Build a snapshot from raw counts. The percentage is truncated, not rounded
    pub fn from_counts(successes: u64, failures: u64) -> Self {
        let total = successes + failures;
        let error_percentage = if total == 0 {
            0
        } else if successes == 0 {
            100
        } else {
            ((failures as u128 * 100) / total as u128) as u32
        };

        Self {
            total,
            error_percentage,
        }
    }
}

const NEVER: u64 = u64::MAX;

#[derive(Debug)]
struct Bucket {
    counts: [AtomicU64; 2],
    started_at: u64,
}

impl Bucket {
    fn new(started_at: u64) -> Self {
        Self {
            counts: [AtomicU64::new(0), AtomicU64::new(0)],
            started_at,
        }
    }

    fn count(&self, kind: OutcomeKind) -> u64 {
        self.counts[kind.index()].load(Ordering::Acquire)
    }
}

/// Rolling success/failure counters for one breaker key
#[derive(Debug)]
pub struct WindowedMetrics {
    key: Key,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    bucket: ArcSwap<Bucket>,
    resetting: AtomicBool,
    last_snapshot_at: AtomicU64,
    snapshot: ArcSwap<MetricsSnapshot>,
    #[cfg(test)]
    recomputations: std::sync::atomic::AtomicUsize,
}

impl WindowedMetrics {
    pub fn new(key: Key, config: Arc<dyn ConfigSource>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            key,
            config,
            clock,
            bucket: ArcSwap::from_pointee(Bucket::new(now)),
            resetting: AtomicBool::new(false),
            last_snapshot_at: AtomicU64::new(NEVER),
            snapshot: ArcSwap::from_pointee(MetricsSnapshot::default()),
            #[cfg(test)]
            recomputations: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Record one outcome, resetting first if the window has elapsed
    pub fn increment(&self, kind: OutcomeKind) {
        self.reset_if_window_elapsed();
        self.bucket.load().counts[kind.index()].fetch_add(1, Ordering::AcqRel);
    }

    /// Cached or freshly computed snapshot of the current window
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ttl = self.config.breaker(&self.key).snapshot_ttl_millis;
        let now = self.clock.now_millis();
        let last = self.last_snapshot_at.load(Ordering::Acquire);

        if last != NEVER && now < last.saturating_add(ttl) {
            return **self.snapshot.load();
        }

        // Losers of the race keep the cached value for this TTL window
        if self
            .last_snapshot_at
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return **self.snapshot.load();
        }

        #[cfg(test)]
        self.recomputations.fetch_add(1, Ordering::AcqRel);

        self.reset_if_window_elapsed();
        let (successes, failures) = self.counts();
        let snapshot = MetricsSnapshot::from_counts(successes, failures);
        self.snapshot.store(Arc::new(snapshot));
        snapshot
    }

    /// Live `(successes, failures)` of the current bucket, bypassing the snapshot cache
    pub fn counts(&self) -> (u64, u64) {
        let bucket = self.bucket.load();
        (
            bucket.count(OutcomeKind::Success),
            bucket.count(OutcomeKind::Failure),
        )
    }

    /// Swap in fresh counters and drop the cached snapshot.
    ///
    /// Concurrent callers do not queue: if a reset is already in progress
    /// the call is a no-op.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        if self.reset_at(now) {
            self.snapshot.store(Arc::new(MetricsSnapshot::default()));
            self.last_snapshot_at.store(NEVER, Ordering::Release);
        }
    }

    fn reset_if_window_elapsed(&self) {
        let window = self.config.breaker(&self.key).window_millis;
        let now = self.clock.now_millis();
        let started_at = self.bucket.load().started_at;

        if now.saturating_sub(started_at) > window {
            self.reset_at(now);
        }
    }

    fn reset_at(&self, now: u64) -> bool {
        if self
            .resetting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.bucket.store(Arc::new(Bucket::new(now)));
        self.resetting.store(false, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, MemoryConfig};
    use std::sync::Barrier;
    use std::thread;

    fn metrics_with(config: BreakerConfig) -> (WindowedMetrics, Arc<ManualClock>) {
        let key = Key::new("metrics_test").unwrap();
        let source = MemoryConfig::new();
        source.set_breaker(&key, config);
        let clock = Arc::new(ManualClock::new(1_000));
        let metrics = WindowedMetrics::new(key, Arc::new(source), clock.clone());
        (metrics, clock)
    }

    fn uncached() -> BreakerConfig {
        BreakerConfig {
            snapshot_ttl_millis: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_error_percentage_edges() {
        assert_eq!(MetricsSnapshot::from_counts(0, 0).error_percentage, 0);
        assert_eq!(MetricsSnapshot::from_counts(0, 1).error_percentage, 100);
        assert_eq!(MetricsSnapshot::from_counts(1, 0).error_percentage, 0);
        assert_eq!(MetricsSnapshot::from_counts(1, 1).error_percentage, 50);
        assert_eq!(MetricsSnapshot::from_counts(99, 1).error_percentage, 1);
    }

    #[test]
    fn test_error_percentage_truncates() {
        // 49.9% truncates to 49
        assert_eq!(MetricsSnapshot::from_counts(501, 499).error_percentage, 49);
        // 66.6% truncates to 66
        assert_eq!(MetricsSnapshot::from_counts(1, 2).error_percentage, 66);
        assert_eq!(MetricsSnapshot::from_counts(2, 1).total, 3);
    }

    #[test]
    fn test_increment_and_snapshot() {
        let (metrics, _clock) = metrics_with(uncached());

        metrics.increment(OutcomeKind::Success);
        metrics.increment(OutcomeKind::Success);
        metrics.increment(OutcomeKind::Failure);

        assert_eq!(metrics.counts(), (2, 1));
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                total: 3,
                error_percentage: 33
            }
        );
    }

    #[test]
    fn test_snapshot_is_cached_for_ttl() {
        let (metrics, clock) = metrics_with(BreakerConfig {
            snapshot_ttl_millis: 1_000,
            ..Default::default()
        });

        metrics.increment(OutcomeKind::Failure);
        assert_eq!(metrics.snapshot().total, 1);

        metrics.increment(OutcomeKind::Failure);
        clock.advance(999);
        assert_eq!(metrics.snapshot().total, 1, "still inside the TTL");

        clock.advance(1);
        assert_eq!(metrics.snapshot().total, 2, "TTL elapsed");
    }

    #[test]
    fn test_expired_snapshot_is_recomputed_once_under_contention() {
        let (metrics, clock) = metrics_with(BreakerConfig {
            snapshot_ttl_millis: 1_000,
            ..Default::default()
        });

        metrics.increment(OutcomeKind::Success);
        let cached = metrics.snapshot();
        assert_eq!(cached.total, 1);

        metrics.increment(OutcomeKind::Failure);
        clock.advance(1_000);
        let fresh = MetricsSnapshot::from_counts(1, 1);
        let before = metrics.recomputations.load(Ordering::Acquire);

        let metrics = Arc::new(metrics);
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    metrics.snapshot()
                })
            })
            .collect();

        for handle in handles {
            let seen = handle.join().unwrap();
            assert!(seen == cached || seen == fresh, "unexpected snapshot {:?}", seen);
        }

        assert_eq!(metrics.recomputations.load(Ordering::Acquire) - before, 1);
        assert_eq!(metrics.snapshot(), fresh);
    }

    #[test]
    fn test_window_elapsed_resets_before_increment() {
        let (metrics, clock) = metrics_with(BreakerConfig {
            window_millis: 500,
            snapshot_ttl_millis: 0,
            ..Default::default()
        });

        metrics.increment(OutcomeKind::Failure);
        metrics.increment(OutcomeKind::Failure);

        clock.advance(500);
        metrics.increment(OutcomeKind::Success);
        assert_eq!(metrics.counts(), (1, 2), "window not yet exceeded");

        clock.advance(1);
        metrics.increment(OutcomeKind::Success);
        assert_eq!(metrics.counts(), (1, 0));
    }

    #[test]
    fn test_snapshot_observes_elapsed_window() {
        let (metrics, clock) = metrics_with(BreakerConfig {
            window_millis: 100,
            snapshot_ttl_millis: 0,
            ..Default::default()
        });

        metrics.increment(OutcomeKind::Failure);
        clock.advance(101);

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_reset_clears_counts_and_cached_snapshot() {
        let (metrics, _clock) = metrics_with(BreakerConfig {
            snapshot_ttl_millis: 60_000,
            ..Default::default()
        });

        metrics.increment(OutcomeKind::Failure);
        assert_eq!(metrics.snapshot().error_percentage, 100);

        metrics.reset();
        assert_eq!(metrics.counts(), (0, 0));
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_resets_keep_counts_sane() {
        let (metrics, _clock) = metrics_with(uncached());
        let metrics = Arc::new(metrics);
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for i in 0..8 {
            let metrics = Arc::clone(&metrics);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    if i % 2 == 0 {
                        metrics.reset();
                    } else {
                        metrics.increment(OutcomeKind::Failure);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let (successes, failures) = metrics.counts();
        assert_eq!(successes, 0);
        assert!(failures <= 400, "got {} failures", failures);

        metrics.reset();
        assert_eq!(metrics.counts(), (0, 0));
    }
}
