//! Failure-percentage circuit breaker
//!
//! The breaker has two states: `Fixed` (allowing calls) and `Tripped`
//! (rejecting calls except one trial per tripped duration). Transitions are
//! driven through a `state_machines` dynamic machine whose guards read the
//! breaker's windowed metrics.
//!
//! Two locks protect the breaker and neither is ever waited on from the
//! admission path:
//! - the state lock wraps the machine; a thread that cannot take it reports
//!   the last-known tripped flag instead of re-evaluating.
//! - the trial lock serializes single-test decisions; a thread that cannot
//!   take it is simply not the trial.

use crate::clock::Clock;
use crate::config::{BreakerConfig, ConfigSource, MemoryConfig};
use crate::events::{BreakerGauge, Events};
use crate::key::Key;
use crate::metrics::WindowedMetrics;
use parking_lot::Mutex;
use state_machines::state_machine;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub key: Key,
    pub config: Arc<dyn ConfigSource>,
    pub metrics: Arc<WindowedMetrics>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        let key = Key::placeholder();
        let config: Arc<dyn ConfigSource> = Arc::new(MemoryConfig::new());
        let metrics = Arc::new(WindowedMetrics::new(
            key.clone(),
            Arc::clone(&config),
            Arc::new(crate::clock::MonotonicClock::new()),
        ));
        Self {
            key,
            config,
            metrics,
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("key", &self.key)
            .field("config", &"<dyn ConfigSource>")
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Data specific to the Tripped state
#[derive(Debug, Clone, Default)]
pub struct TrippedData {
    pub tripped_at: u64,
    /// Set once a call that began after the trip has succeeded
    pub recovered: bool,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Fixed,
    states: [
        Fixed,
        Tripped(TrippedData),
    ],
    events {
        trip {
            guards: [should_trip],
            transition: { from: Fixed, to: Tripped }
        }
        fix {
            guards: [recovery_observed],
            transition: { from: Tripped, to: Fixed }
        }
    }
}

impl Circuit<Fixed> {
    /// Enough operations in the window and an error rate at or above the threshold
    fn should_trip(&self, ctx: &CircuitContext) -> bool {
        let config = ctx.config.breaker(&ctx.key);
        let snapshot = ctx.metrics.snapshot();

        if snapshot.total < config.minimum_operations {
            return false;
        }

        snapshot.error_percentage >= config.threshold_percentage
    }
}

impl Circuit<Tripped> {
    fn recovery_observed(&self, _ctx: &CircuitContext) -> bool {
        self.state_data_tripped()
            .map(|data| data.recovered)
            .unwrap_or(false)
    }
}

const FIXED: &str = "Fixed";
const TRIPPED: &str = "Tripped";

/// Per-key circuit breaker
pub struct CircuitBreaker {
    key: Key,
    machine: Mutex<DynamicCircuit>,
    trial_lock: Mutex<()>,
    /// Last-known state, readable without the state lock
    tripped: AtomicBool,
    /// Time of the trip or of the latest granted trial
    last_tripped_at: AtomicU64,
    metrics: Arc<WindowedMetrics>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    events: Events,
}

impl CircuitBreaker {
    /// Create a breaker in the `Fixed` state with fresh metrics
    pub fn new(
        key: Key,
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
        events: Events,
    ) -> Self {
        let metrics = Arc::new(WindowedMetrics::new(
            key.clone(),
            Arc::clone(&config),
            Arc::clone(&clock),
        ));
        let context = CircuitContext {
            key: key.clone(),
            config: Arc::clone(&config),
            metrics: Arc::clone(&metrics),
        };

        Self {
            key,
            machine: Mutex::new(DynamicCircuit::new(context)),
            trial_lock: Mutex::new(()),
            tripped: AtomicBool::new(false),
            last_tripped_at: AtomicU64::new(0),
            metrics,
            config,
            clock,
            events,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Metrics window feeding this breaker
    pub fn metrics(&self) -> &Arc<WindowedMetrics> {
        &self.metrics
    }

    /// Decide whether a call may proceed. Never blocks
    pub fn is_allowing(&self) -> bool {
        let config = self.config.breaker(&self.key);

        if config.force_tripped {
            return false;
        }

        if config.force_fixed {
            // Keep trip bookkeeping current for gauges, but always allow
            self.check_and_set_tripped();
            return true;
        }

        if !self.check_and_set_tripped() {
            return true;
        }

        self.allow_single_test(&config)
    }

    /// Record a successful call that took `elapsed_millis`.
    ///
    /// Only a call that started at or after the latest trip (or trial grant)
    /// proves recovery; successes of calls already in flight when the breaker
    /// tripped are ignored.
    pub fn mark_success(&self, elapsed_millis: u64) {
        if !self.tripped.load(Ordering::Acquire) {
            return;
        }

        let started_at = self.clock.now_millis().saturating_sub(elapsed_millis);
        if started_at < self.last_tripped_at.load(Ordering::Acquire) {
            debug!(
                breaker = %self.key,
                started_at,
                "Ignoring success of call that started before the trip"
            );
            return;
        }

        let mut machine = self.machine.lock();
        if let Some(data) = machine.tripped_data_mut() {
            data.recovered = true;
        }

        if machine.handle(CircuitEvent::Fix).is_ok() {
            self.tripped.store(false, Ordering::Release);
            self.metrics.reset();
            drop(machine);

            info!(breaker = %self.key, "Fixed");
            self.events.emit("breaker_fixed", |s| s.breaker_fixed(&self.key));
        }
    }

    /// Last-known state, without evaluating metrics
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Current state name ("Fixed" or "Tripped")
    pub fn state_name(&self) -> &'static str {
        if self.is_tripped() { TRIPPED } else { FIXED }
    }

    /// Time of the trip or of the latest granted trial, per the breaker clock
    pub fn last_tripped_at(&self) -> u64 {
        self.last_tripped_at.load(Ordering::Acquire)
    }

    /// Gauge snapshot: live config, tripped flag and window counts
    pub fn gauge(&self) -> BreakerGauge {
        let (successes, failures) = self.metrics.counts();
        BreakerGauge {
            breaker: self.key.clone(),
            config: self.config.breaker(&self.key),
            tripped: self.is_tripped(),
            successes,
            failures,
        }
    }

    /// Evaluate metrics and trip if warranted; returns the resulting state.
    ///
    /// Contended callers get the last-known state instead of waiting.
    fn check_and_set_tripped(&self) -> bool {
        let Some(mut machine) = self.machine.try_lock() else {
            return self.tripped.load(Ordering::Acquire);
        };

        if machine.current_state() == TRIPPED {
            return true;
        }

        if machine.handle(CircuitEvent::Trip).is_err() {
            return false;
        }

        let now = self.clock.now_millis();
        if let Some(data) = machine.tripped_data_mut() {
            data.tripped_at = now;
        }
        self.last_tripped_at.store(now, Ordering::Release);
        self.tripped.store(true, Ordering::Release);
        drop(machine);

        let snapshot = self.metrics.snapshot();
        warn!(
            breaker = %self.key,
            total = snapshot.total,
            error_percentage = snapshot.error_percentage,
            "Tripped"
        );
        self.events
            .emit("breaker_tripped", |s| s.breaker_tripped(&self.key));
        true
    }

    /// Grant at most one trial per tripped duration
    fn allow_single_test(&self, config: &BreakerConfig) -> bool {
        let Some(_trial) = self.trial_lock.try_lock() else {
            return false;
        };

        if !self.tripped.load(Ordering::Acquire) {
            return false;
        }

        let now = self.clock.now_millis();
        let last = self.last_tripped_at.load(Ordering::Acquire);
        let wait = tripped_wait_millis(config);

        if now > last.saturating_add(wait) {
            self.last_tripped_at.store(now, Ordering::Release);
            info!(breaker = %self.key, waited = now - last, "Allowing single test operation");
            return true;
        }

        false
    }
}

/// Tripped duration, shortened by jitter when configured
fn tripped_wait_millis(config: &BreakerConfig) -> u64 {
    if config.trial_jitter_factor > 0.0 {
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: config.tripped_duration_millis,
            multiplier: 1.0,
            max_delay_ms: config.tripped_duration_millis,
        };
        policy.calculate_delay(1, config.trial_jitter_factor)
    } else {
        config.tripped_duration_millis
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("tripped", &self.is_tripped())
            .field("last_tripped_at", &self.last_tripped_at())
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::testing::RecordingEvents;
    use crate::metrics::OutcomeKind;

    struct Fixture {
        breaker: CircuitBreaker,
        clock: Arc<ManualClock>,
        config: Arc<MemoryConfig>,
        events: Arc<RecordingEvents>,
        key: Key,
    }

    fn fixture(config: BreakerConfig) -> Fixture {
        let key = Key::new("payments").unwrap();
        let source = Arc::new(MemoryConfig::new());
        source.set_breaker(&key, config);
        let clock = Arc::new(ManualClock::new(10_000));
        let events = Arc::new(RecordingEvents::default());

        let breaker = CircuitBreaker::new(
            key.clone(),
            source.clone(),
            clock.clone(),
            Events::new(events.clone()),
        );

        Fixture {
            breaker,
            clock,
            config: source,
            events,
            key,
        }
    }

    fn strict() -> BreakerConfig {
        BreakerConfig {
            minimum_operations: 5,
            threshold_percentage: 50,
            tripped_duration_millis: 1_000,
            snapshot_ttl_millis: 0,
            ..Default::default()
        }
    }

    fn record(breaker: &CircuitBreaker, successes: u64, failures: u64) {
        for _ in 0..successes {
            breaker.metrics().increment(OutcomeKind::Success);
        }
        for _ in 0..failures {
            breaker.metrics().increment(OutcomeKind::Failure);
        }
    }

    #[test]
    fn test_starts_fixed_and_allowing() {
        let f = fixture(strict());

        assert!(f.breaker.is_allowing());
        assert!(!f.breaker.is_tripped());
        assert_eq!(f.breaker.state_name(), "Fixed");
    }

    #[test]
    fn test_below_minimum_operations_never_trips() {
        let f = fixture(strict());
        record(&f.breaker, 0, 4);

        for _ in 0..10 {
            assert!(f.breaker.is_allowing());
        }
        assert!(!f.breaker.is_tripped());
    }

    #[test]
    fn test_below_threshold_does_not_trip() {
        let f = fixture(strict());
        record(&f.breaker, 6, 5);

        // 5/11 = 45%
        assert!(f.breaker.is_allowing());
        assert!(!f.breaker.is_tripped());
    }

    #[test]
    fn test_trips_at_threshold_and_rejects() {
        let f = fixture(strict());
        record(&f.breaker, 3, 3);

        assert!(!f.breaker.is_allowing(), "50% of 6 operations trips");
        assert!(f.breaker.is_tripped());
        assert_eq!(f.breaker.state_name(), "Tripped");
        assert_eq!(f.breaker.last_tripped_at(), 10_000);
        assert_eq!(f.events.count("breaker_tripped"), 1);

        f.clock.advance(1_000);
        assert!(!f.breaker.is_allowing(), "wait not yet exceeded");
        assert_eq!(f.events.count("breaker_tripped"), 1, "trip emitted once");
    }

    #[test]
    fn test_single_trial_after_tripped_duration() {
        let f = fixture(strict());
        record(&f.breaker, 0, 5);
        assert!(!f.breaker.is_allowing());

        f.clock.set(11_001);
        assert!(f.breaker.is_allowing(), "first call after wait is the trial");
        assert!(!f.breaker.is_allowing(), "only one trial per wait");
        assert!(!f.breaker.is_allowing());
        assert_eq!(f.breaker.last_tripped_at(), 11_001);
    }

    #[test]
    fn test_successful_trial_fixes_and_resets_metrics() {
        let f = fixture(strict());
        record(&f.breaker, 0, 5);
        assert!(!f.breaker.is_allowing());

        f.clock.set(11_001);
        assert!(f.breaker.is_allowing());

        f.clock.advance(20);
        f.breaker.mark_success(20);

        assert!(!f.breaker.is_tripped());
        assert_eq!(f.breaker.metrics().counts(), (0, 0));
        assert_eq!(f.events.count("breaker_fixed"), 1);
        assert!(f.breaker.is_allowing());
    }

    #[test]
    fn test_failed_trial_restarts_wait_from_trial() {
        let f = fixture(strict());
        record(&f.breaker, 0, 5);
        assert!(!f.breaker.is_allowing());

        f.clock.set(11_001);
        assert!(f.breaker.is_allowing());
        // The trial fails: no mark_success
        f.breaker.metrics().increment(OutcomeKind::Failure);

        f.clock.set(12_001);
        assert!(!f.breaker.is_allowing(), "wait restarted at 11_001");

        f.clock.set(12_002);
        assert!(f.breaker.is_allowing());
    }

    #[test]
    fn test_stale_success_does_not_fix() {
        let f = fixture(strict());
        record(&f.breaker, 0, 5);
        assert!(!f.breaker.is_allowing());

        // Call began 500ms before the trip at 10_000
        f.clock.advance(100);
        f.breaker.mark_success(600);

        assert!(f.breaker.is_tripped());
        assert_eq!(f.events.count("breaker_fixed"), 0);
    }

    #[test]
    fn test_success_while_fixed_is_ignored() {
        let f = fixture(strict());
        record(&f.breaker, 1, 1);

        f.breaker.mark_success(5);

        assert_eq!(f.breaker.metrics().counts(), (1, 1));
        assert_eq!(f.events.count("breaker_fixed"), 0);
    }

    #[test]
    fn test_force_tripped_rejects_without_metrics() {
        let f = fixture(strict());
        f.config.update_breaker(&f.key, |c| c.force_tripped = true);

        assert!(!f.breaker.is_allowing());
        assert!(!f.breaker.is_tripped(), "forced rejection is not a trip");

        f.config.update_breaker(&f.key, |c| c.force_tripped = false);
        assert!(f.breaker.is_allowing());
    }

    #[test]
    fn test_force_fixed_allows_but_tracks_trip() {
        let f = fixture(strict());
        f.config.update_breaker(&f.key, |c| c.force_fixed = true);
        record(&f.breaker, 0, 10);

        assert!(f.breaker.is_allowing());
        assert!(f.breaker.is_allowing());
        assert!(f.breaker.is_tripped(), "trip recorded for gauges");
        assert!(f.breaker.gauge().tripped);
    }

    #[test]
    fn test_force_tripped_wins_over_force_fixed() {
        let f = fixture(strict());
        f.config.update_breaker(&f.key, |c| {
            c.force_fixed = true;
            c.force_tripped = true;
        });

        assert!(!f.breaker.is_allowing());
    }

    #[test]
    fn test_reconfigured_threshold_applies_on_next_check() {
        let f = fixture(strict());
        record(&f.breaker, 7, 3);
        assert!(f.breaker.is_allowing(), "30% is below 50%");

        f.config.update_breaker(&f.key, |c| c.threshold_percentage = 30);
        assert!(!f.breaker.is_allowing());
    }

    #[test]
    fn test_contended_state_lock_reports_last_known_state() {
        let f = fixture(strict());
        record(&f.breaker, 0, 10);

        let held = f.breaker.machine.lock();
        // Would trip, but the lock is held: last-known state (fixed) wins
        assert!(f.breaker.is_allowing());
        drop(held);

        assert!(!f.breaker.is_allowing());
    }

    #[test]
    fn test_contended_trial_lock_denies_trial() {
        let f = fixture(strict());
        record(&f.breaker, 0, 10);
        assert!(!f.breaker.is_allowing());
        f.clock.set(20_000);

        let held = f.breaker.trial_lock.lock();
        assert!(!f.breaker.is_allowing());
        drop(held);

        assert!(f.breaker.is_allowing());
    }

    #[test]
    fn test_gauge_reports_counts_and_config() {
        let f = fixture(strict());
        record(&f.breaker, 2, 1);

        let gauge = f.breaker.gauge();
        assert_eq!(gauge.breaker, f.key);
        assert_eq!((gauge.successes, gauge.failures), (2, 1));
        assert_eq!(gauge.config.minimum_operations, 5);
        assert!(!gauge.tripped);
    }

    #[test]
    fn test_state_machine_fixed_to_tripped_guard() {
        let key = Key::new("machine_test").unwrap();
        let source = Arc::new(MemoryConfig::new());
        source.set_breaker(&key, strict());
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(WindowedMetrics::new(key.clone(), source.clone(), clock));

        let ctx = CircuitContext {
            key,
            config: source,
            metrics: metrics.clone(),
        };
        let mut circuit = DynamicCircuit::new(ctx);

        let result = circuit.handle(CircuitEvent::Trip);
        assert!(result.is_err(), "Should fail guard with no operations");

        for _ in 0..5 {
            metrics.increment(OutcomeKind::Failure);
        }

        circuit
            .handle(CircuitEvent::Trip)
            .expect("Should trip after reaching threshold");
        assert_eq!(circuit.current_state(), "Tripped");

        assert!(
            circuit.handle(CircuitEvent::Fix).is_err(),
            "Fix requires observed recovery"
        );
        circuit.tripped_data_mut().expect("tripped data").recovered = true;
        circuit.handle(CircuitEvent::Fix).expect("Should fix");
        assert_eq!(circuit.current_state(), "Fixed");
    }

    #[test]
    fn test_zero_jitter_produces_exact_wait() {
        let config = BreakerConfig {
            tripped_duration_millis: 1_000,
            ..Default::default()
        };

        for _ in 0..10 {
            assert_eq!(tripped_wait_millis(&config), 1_000);
        }
    }

    #[test]
    fn test_jitter_shortens_wait_within_bounds() {
        let config = BreakerConfig {
            tripped_duration_millis: 1_000,
            trial_jitter_factor: 0.25,
            ..Default::default()
        };

        for _ in 0..50 {
            let wait = tripped_wait_millis(&config);
            assert!(
                (740..=1_010).contains(&wait),
                "jittered wait {} out of bounds",
                wait
            );
        }
    }

    #[test]
    fn test_concurrent_trials_grant_exactly_one() {
        let f = fixture(strict());
        record(&f.breaker, 0, 10);
        assert!(!f.breaker.is_allowing());
        f.clock.set(20_000);

        let breaker = Arc::new(f.breaker);
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    breaker.is_allowing()
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 1);
    }
}
