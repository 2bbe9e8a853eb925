//! Builder API for assembling a command invoker

use crate::{
    classifier::{IgnorePolicy, NeverIgnore},
    clock::{Clock, MonotonicClock},
    config::{ConfigSource, MemoryConfig},
    events::{Events, IgnoredMetricEvents, MetricEvents},
    invoker::CommandInvoker,
};
use std::sync::Arc;

/// Builder for [`CommandInvoker`] with fluent API
///
/// Every collaborator is optional: the defaults are an in-memory config with
/// default settings, the monotonic clock, a sink that drops every event, and
/// a policy that counts every failure.
#[derive(Default)]
pub struct InvokerBuilder {
    config: Option<Arc<dyn ConfigSource>>,
    clock: Option<Arc<dyn Clock>>,
    metric_events: Option<Arc<dyn MetricEvents>>,
    ignore_policy: Option<Arc<dyn IgnorePolicy>>,
}

impl InvokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source of live settings
    pub fn config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the clock used for windows, trips and elapsed times
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the sink receiving pipeline events
    ///
    /// # Examples
    ///
    /// ```rust
    /// use isolation_machines::{CommandInvoker, TracingMetricEvents};
    /// use std::sync::Arc;
    ///
    /// let invoker = CommandInvoker::builder()
    ///     .metric_events(Arc::new(TracingMetricEvents))
    ///     .build();
    /// ```
    pub fn metric_events(mut self, sink: Arc<dyn MetricEvents>) -> Self {
        self.metric_events = Some(sink);
        self
    }

    /// Set the policy deciding which failures stay out of breaker bookkeeping
    ///
    /// # Examples
    ///
    /// ```rust
    /// use isolation_machines::{CommandInvoker, DeadlineExceeded, IgnoredTypes};
    /// use std::sync::Arc;
    ///
    /// // Timeouts surface to callers but never trip a breaker
    /// let invoker = CommandInvoker::builder()
    ///     .ignore_policy(Arc::new(IgnoredTypes::new().ignore::<DeadlineExceeded>()))
    ///     .build();
    /// ```
    pub fn ignore_policy(mut self, policy: Arc<dyn IgnorePolicy>) -> Self {
        self.ignore_policy = Some(policy);
        self
    }

    /// Build the invoker
    pub fn build(self) -> CommandInvoker {
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(MemoryConfig::new()));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let events = Events::new(
            self.metric_events
                .unwrap_or_else(|| Arc::new(IgnoredMetricEvents)),
        );
        let ignore = self
            .ignore_policy
            .unwrap_or_else(|| Arc::new(NeverIgnore));

        CommandInvoker::from_parts(config, clock, events, ignore)
    }
}

impl std::fmt::Debug for InvokerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("metric_events", &self.metric_events.is_some())
            .field("ignore_policy", &self.ignore_policy)
            .finish()
    }
}
