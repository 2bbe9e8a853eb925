//! Metric event sink for the isolation pipeline
//!
//! The pipeline reports what it does through [`MetricEvents`]. Sinks are
//! fire-and-forget: every callback is invoked through [`Events`], which
//! catches panics and logs them so a broken sink cannot fail a call.

use crate::command::{CommandStatus, FailureAction};
use crate::config::BreakerConfig;
use crate::key::Key;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Point-in-time state of a bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadGauge {
    pub bulkhead: Key,
    pub kind: &'static str,
    pub max_concurrent: usize,
    pub count_available: usize,
}

/// Point-in-time state of a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerGauge {
    pub breaker: Key,
    pub config: BreakerConfig,
    pub tripped: bool,
    pub successes: u64,
    pub failures: u64,
}

/// Receiver for pipeline events. All methods default to no-ops.
///
/// Implementations must not block: they are called inline on the calling
/// thread, including on the admission path.
pub trait MetricEvents: Send + Sync {
    /// One call finished (any outcome other than bypass)
    fn command_invoked(
        &self,
        _command: &str,
        _invoke_millis: u64,
        _execute_millis: u64,
        _status: CommandStatus,
        _failure_action: FailureAction,
    ) {
    }

    fn enter_bulkhead(&self, _bulkhead: &Key, _command: &str) {}

    fn leave_bulkhead(&self, _bulkhead: &Key, _command: &str) {}

    fn reject_bulkhead(&self, _bulkhead: &Key, _command: &str) {}

    fn bulkhead_gauge(&self, _gauge: &BulkheadGauge) {}

    fn breaker_tripped(&self, _breaker: &Key) {}

    fn breaker_fixed(&self, _breaker: &Key) {}

    fn reject_breaker(&self, _breaker: &Key, _command: &str) {}

    fn breaker_success_count(&self, _breaker: &Key, _command: &str) {}

    fn breaker_failure_count(&self, _breaker: &Key, _command: &str) {}

    fn breaker_gauge(&self, _gauge: &BreakerGauge) {}
}

/// Sink that discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoredMetricEvents;

impl MetricEvents for IgnoredMetricEvents {}

/// Sink that renders events as `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricEvents;

impl MetricEvents for TracingMetricEvents {
    fn command_invoked(
        &self,
        command: &str,
        invoke_millis: u64,
        execute_millis: u64,
        status: CommandStatus,
        failure_action: FailureAction,
    ) {
        debug!(
            target: "isolation_machines::events",
            command,
            invoke_millis,
            execute_millis,
            %status,
            %failure_action,
            "Command invoked"
        );
    }

    fn reject_bulkhead(&self, bulkhead: &Key, command: &str) {
        warn!(target: "isolation_machines::events", %bulkhead, command, "Bulkhead rejected");
    }

    fn bulkhead_gauge(&self, gauge: &BulkheadGauge) {
        debug!(
            target: "isolation_machines::events",
            bulkhead = %gauge.bulkhead,
            kind = gauge.kind,
            max_concurrent = gauge.max_concurrent,
            count_available = gauge.count_available,
            "Bulkhead gauge"
        );
    }

    fn breaker_tripped(&self, breaker: &Key) {
        warn!(target: "isolation_machines::events", %breaker, "Breaker tripped");
    }

    fn breaker_fixed(&self, breaker: &Key) {
        info!(target: "isolation_machines::events", %breaker, "Breaker fixed");
    }

    fn reject_breaker(&self, breaker: &Key, command: &str) {
        warn!(target: "isolation_machines::events", %breaker, command, "Breaker rejected");
    }

    fn breaker_gauge(&self, gauge: &BreakerGauge) {
        debug!(
            target: "isolation_machines::events",
            breaker = %gauge.breaker,
            tripped = gauge.tripped,
            successes = gauge.successes,
            failures = gauge.failures,
            minimum_operations = gauge.config.minimum_operations,
            threshold_percentage = gauge.config.threshold_percentage,
            tripped_duration_millis = gauge.config.tripped_duration_millis,
            window_millis = gauge.config.window_millis,
            force_tripped = gauge.config.force_tripped,
            force_fixed = gauge.config.force_fixed,
            "Breaker gauge"
        );
    }
}

/// Panic-isolating handle to the configured sink
#[derive(Clone)]
pub struct Events {
    sink: Arc<dyn MetricEvents>,
}

impl Events {
    pub fn new(sink: Arc<dyn MetricEvents>) -> Self {
        Self { sink }
    }

    /// Invoke one sink callback; a panicking sink is logged and swallowed
    pub fn emit<F>(&self, event: &'static str, f: F)
    where
        F: FnOnce(&dyn MetricEvents),
    {
        let sink = self.sink.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(sink))).is_err() {
            error!(event, "Metric event sink panicked; event dropped");
        }
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(Arc::new(IgnoredMetricEvents))
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("sink", &"<dyn MetricEvents>")
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{PanickingEvents, RecordingEvents};
    use super::*;

    #[test]
    fn test_emit_forwards_to_sink() {
        let sink = Arc::new(RecordingEvents::default());
        let events = Events::new(sink.clone());
        let key = Key::new("payments").unwrap();

        events.emit("breaker_tripped", |s| s.breaker_tripped(&key));

        assert_eq!(sink.lines(), vec!["breaker_tripped payments".to_string()]);
    }

    #[test]
    fn test_emit_swallows_sink_panics() {
        let events = Events::new(Arc::new(PanickingEvents));
        let key = Key::new("payments").unwrap();

        events.emit("breaker_tripped", |s| s.breaker_tripped(&key));
        // Still usable afterwards
        events.emit("breaker_fixed", |s| s.breaker_fixed(&key));
    }

    #[test]
    fn test_default_sink_ignores_everything() {
        let events = Events::default();
        let key = Key::new("payments").unwrap();

        events.emit("reject_bulkhead", |s| s.reject_bulkhead(&key, "payments.Charge"));
    }
}
