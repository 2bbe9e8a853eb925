//! IsolationMachines - per-dependency call isolation
//!
//! This crate wraps calls to unreliable dependencies with:
//! - Semaphore bulkheads bounding concurrent calls per key, resizable live
//! - Failure-rate circuit breakers (Fixed → Tripped → Fixed) with a single
//!   test call per tripped duration
//! - Windowed success/failure metrics with cached snapshots
//! - Cooperative per-call timeouts, fallbacks and an exception-ignore policy
//! - Fire-and-forget metric events and periodic gauges
//!
//! # Example
//!
//! ```rust
//! use isolation_machines::{CallOptions, Command, CommandInvoker, Key, MemoryConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = Arc::new(MemoryConfig::new());
//! let invoker = CommandInvoker::builder().config(config).build();
//!
//! let group = Key::new("payments").unwrap();
//! let command = Command::new(group, "Charge", Duration::from_secs(2)).unwrap();
//!
//! // Protected call with a degraded-mode fallback
//! let options = CallOptions::new().with_fallback(|_err| Ok("queued"));
//! let result = invoker.invoke_with(&command, options, |token| {
//!     if token.is_cancelled() {
//!         return Err("gave up");
//!     }
//!     Ok("charged")
//! });
//!
//! assert_eq!(result.unwrap(), "charged");
//! ```

pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod factory;
pub mod gauges;
pub mod invoker;
pub mod key;
pub mod metrics;

pub use builder::InvokerBuilder;
pub use bulkhead::{BulkheadGuard, BulkheadHolder, SemaphoreBulkhead};
pub use circuit::CircuitBreaker;
pub use classifier::{
    DeadlineExceeded, FailureContext, IgnorePolicy, IgnoredTypes, NeverIgnore, PredicateIgnore,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use command::{CallOptions, CallResult, CallToken, Command, CommandStatus, FailureAction};
pub use config::{BreakerConfig, BulkheadConfig, ConfigSource, GlobalConfig, MemoryConfig, Settings};
pub use errors::{CallError, ValidationError};
pub use events::{BreakerGauge, BulkheadGauge, IgnoredMetricEvents, MetricEvents, TracingMetricEvents};
pub use factory::{BreakerFactory, BulkheadFactory};
pub use gauges::GaugeReporter;
pub use invoker::CommandInvoker;
pub use key::Key;
pub use metrics::{MetricsSnapshot, OutcomeKind, WindowedMetrics};
