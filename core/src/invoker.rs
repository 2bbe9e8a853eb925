//! Call orchestration: bulkhead → breaker → timed execution → bookkeeping
//!
//! Every call walks the same pipeline whether it is synchronous or async,
//! and whether failures are thrown or returned:
//!
//! 1. kill switch off: run the work directly, nothing else
//! 2. enter the bulkhead, or reject
//! 3. ask the breaker, or reject (and leave the bulkhead)
//! 4. run the work under a deadline with a [`CallToken`]
//! 5. classify the outcome and update the breaker and its metrics
//! 6. leave the bulkhead, run the fallback if any, report the call

use crate::builder::InvokerBuilder;
use crate::bulkhead::{BulkheadGuard, BulkheadHolder};
use crate::circuit::CircuitBreaker;
use crate::classifier::{DeadlineExceeded, FailureContext, IgnorePolicy};
use crate::clock::Clock;
use crate::command::{CallOptions, CallResult, CallToken, Command, CommandStatus, FailureAction};
use crate::config::{ConfigSource, GlobalConfig};
use crate::errors::{CallError, ValidationError};
use crate::events::{BulkheadGauge, Events};
use crate::factory::{BreakerFactory, BulkheadFactory};
use crate::key::Key;
use crate::metrics::OutcomeKind;
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Entry point for protected calls.
///
/// Share one invoker per process (or per config source); it owns the
/// per-key breakers and bulkheads.
#[derive(Debug)]
pub struct CommandInvoker {
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    events: Events,
    ignore: Arc<dyn IgnorePolicy>,
    breakers: BreakerFactory,
    bulkheads: BulkheadFactory,
}

/// An admitted call: holds its bulkhead permit until settled
struct Admitted {
    invoke_started_at: u64,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Key,
    permit: BulkheadGuard,
}

enum Admission {
    /// Isolation is globally disabled
    Bypass,
    Run(Admitted),
}

enum Execution<T, E> {
    Completed(Result<T, E>),
    DeadlineExceeded,
}

impl CommandInvoker {
    pub fn builder() -> InvokerBuilder {
        InvokerBuilder::new()
    }

    pub(crate) fn from_parts(
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
        events: Events,
        ignore: Arc<dyn IgnorePolicy>,
    ) -> Self {
        Self {
            breakers: BreakerFactory::new(Arc::clone(&config), Arc::clone(&clock), events.clone()),
            bulkheads: BulkheadFactory::new(Arc::clone(&config)),
            config,
            clock,
            events,
            ignore,
        }
    }

    pub fn config(&self) -> &Arc<dyn ConfigSource> {
        &self.config
    }

    /// Breaker for `key`, if a call has created it
    pub fn breaker(&self, key: &Key) -> Option<Arc<CircuitBreaker>> {
        self.breakers.find(key)
    }

    /// Bulkhead holder for `key`, if a call has created it
    pub fn bulkhead(&self, key: &Key) -> Option<Arc<BulkheadHolder>> {
        self.bulkheads.find(key)
    }

    /// Run synchronous work with default options; failures are returned as `Err`
    pub fn invoke<T, E, F>(&self, command: &Command, work: F) -> Result<T, CallError<E>>
    where
        E: 'static,
        F: FnOnce(&CallToken) -> Result<T, E>,
    {
        self.invoke_with(command, CallOptions::default(), work)
    }

    /// Run synchronous work.
    ///
    /// The deadline is cooperative: the work should poll
    /// [`CallToken::is_cancelled`]. An error returned after the deadline is a
    /// timeout; a value returned after the deadline still counts as success.
    pub fn invoke_with<T, E, F>(
        &self,
        command: &Command,
        options: CallOptions<T, E>,
        work: F,
    ) -> Result<T, CallError<E>>
    where
        E: 'static,
        F: FnOnce(&CallToken) -> Result<T, E>,
    {
        let admitted = match self.admit(command, &options)? {
            Admission::Bypass => return work(&CallToken::none()).map_err(CallError::Bypassed),
            Admission::Run(admitted) => admitted,
        };

        let token = CallToken::with_timeout(admitted.timeout);
        let execute_started_at = self.clock.now_millis();
        let result = match catch_unwind(AssertUnwindSafe(|| work(&token))) {
            Ok(result) => result,
            Err(panic) => {
                let execute_millis = self.clock.now_millis().saturating_sub(execute_started_at);
                self.abandon(command, admitted, execute_millis, options.failure_action);
                resume_unwind(panic);
            }
        };
        let execute_millis = self.clock.now_millis().saturating_sub(execute_started_at);

        let execution = match result {
            Err(_) if token.is_cancelled() => Execution::DeadlineExceeded,
            other => Execution::Completed(other),
        };

        self.settle(command, admitted, execution, execute_millis, options)
    }

    /// Like [`invoke_with`](Self::invoke_with) but never returns `Err`
    pub fn invoke_return<T, E, F>(
        &self,
        command: &Command,
        options: CallOptions<T, E>,
        work: F,
    ) -> CallResult<T, E>
    where
        E: 'static,
        F: FnOnce(&CallToken) -> Result<T, E>,
    {
        self.invoke_with(command, options.failure_action(FailureAction::Return), work)
            .into()
    }

    /// Run async work with default options
    pub async fn invoke_async<T, E, F, Fut>(
        &self,
        command: &Command,
        work: F,
    ) -> Result<T, CallError<E>>
    where
        E: 'static,
        F: FnOnce(CallToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_async_with(command, CallOptions::default(), work)
            .await
    }

    /// Run async work. The work future is dropped once the deadline passes
    pub async fn invoke_async_with<T, E, F, Fut>(
        &self,
        command: &Command,
        options: CallOptions<T, E>,
        work: F,
    ) -> Result<T, CallError<E>>
    where
        E: 'static,
        F: FnOnce(CallToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted = match self.admit(command, &options)? {
            Admission::Bypass => {
                return work(CallToken::none()).await.map_err(CallError::Bypassed);
            }
            Admission::Run(admitted) => admitted,
        };

        let token = CallToken::with_timeout(admitted.timeout);
        let execute_started_at = self.clock.now_millis();
        let future = work(token.clone());

        let execution = match admitted.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, future).await {
                Ok(result) => Execution::Completed(result),
                Err(_) => {
                    token.cancel();
                    Execution::DeadlineExceeded
                }
            },
            None => Execution::Completed(future.await),
        };
        let execute_millis = self.clock.now_millis().saturating_sub(execute_started_at);

        self.settle(command, admitted, execution, execute_millis, options)
    }

    /// Like [`invoke_async_with`](Self::invoke_async_with) but never returns `Err`
    pub async fn invoke_return_async<T, E, F, Fut>(
        &self,
        command: &Command,
        options: CallOptions<T, E>,
        work: F,
    ) -> CallResult<T, E>
    where
        E: 'static,
        F: FnOnce(CallToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_async_with(command, options.failure_action(FailureAction::Return), work)
            .await
            .into()
    }

    /// Emit one gauge per known bulkhead and breaker
    pub fn report_gauges(&self) {
        for holder in self.bulkheads.all() {
            let computed = compute_gauge("bulkhead", holder.key(), || BulkheadGauge {
                bulkhead: holder.key().clone(),
                kind: "semaphore",
                max_concurrent: holder.max_concurrent(),
                count_available: holder.count_available(),
            });
            if let Some(gauge) = computed {
                self.events
                    .emit("bulkhead_gauge", |s| s.bulkhead_gauge(&gauge));
            }
        }

        for breaker in self.breakers.all() {
            if let Some(gauge) = compute_gauge("breaker", breaker.key(), || breaker.gauge()) {
                self.events
                    .emit("breaker_gauge", |s| s.breaker_gauge(&gauge));
            }
        }
    }

    /// Steps 1-3: kill switch, bulkhead, breaker
    fn admit<T, E>(
        &self,
        command: &Command,
        options: &CallOptions<T, E>,
    ) -> Result<Admission, CallError<E>> {
        command.mark_invoked()?;

        let global = self.config.global();
        if !global.enabled {
            debug!(command = command.name(), "Isolation disabled; running work directly");
            return Ok(Admission::Bypass);
        }

        let invoke_started_at = self.clock.now_millis();
        let timeout = self.resolve_timeout(command, options.timeout, &global)?;
        let name = command.name();

        let bulkhead_key = command.bulkhead_key();
        let holder = self.bulkheads.get_bulkhead(bulkhead_key)?;
        let Some(permit) = holder.try_enter() else {
            self.events
                .emit("reject_bulkhead", |s| s.reject_bulkhead(bulkhead_key, name));
            self.report_invoked(
                command,
                invoke_started_at,
                0,
                CommandStatus::RejectedByBulkhead,
                options.failure_action,
            );
            return Err(CallError::BulkheadRejected {
                command: name.to_string(),
                bulkhead: bulkhead_key.clone(),
                max_concurrent: holder.max_concurrent(),
            });
        };
        self.events
            .emit("enter_bulkhead", |s| s.enter_bulkhead(bulkhead_key, name));

        let breaker = if global.use_circuit_breakers {
            let breaker_key = command.breaker_key();
            let breaker = self.breakers.get_breaker(breaker_key);
            if !breaker.is_allowing() {
                self.events
                    .emit("reject_breaker", |s| s.reject_breaker(breaker_key, name));
                self.leave_bulkhead(bulkhead_key, name, permit);
                self.report_invoked(
                    command,
                    invoke_started_at,
                    0,
                    CommandStatus::RejectedByBreaker,
                    options.failure_action,
                );
                return Err(CallError::BreakerRejected {
                    command: name.to_string(),
                    breaker: breaker_key.clone(),
                });
            }
            Some(breaker)
        } else {
            None
        };

        Ok(Admission::Run(Admitted {
            invoke_started_at,
            timeout,
            breaker,
            bulkhead: bulkhead_key.clone(),
            permit,
        }))
    }

    /// Steps 5-6: classify, record, release, fall back, report
    fn settle<T, E>(
        &self,
        command: &Command,
        admitted: Admitted,
        execution: Execution<T, E>,
        execute_millis: u64,
        options: CallOptions<T, E>,
    ) -> Result<T, CallError<E>>
    where
        E: 'static,
    {
        let Admitted {
            invoke_started_at,
            timeout,
            breaker,
            bulkhead,
            permit,
        } = admitted;
        let name = command.name();
        let breaker_key = command.breaker_key();

        let (status, outcome) = match execution {
            Execution::Completed(Ok(value)) => {
                if let Some(breaker) = &breaker {
                    breaker.mark_success(execute_millis);
                    breaker.metrics().increment(OutcomeKind::Success);
                    self.events.emit("breaker_success_count", |s| {
                        s.breaker_success_count(breaker_key, name)
                    });
                }
                (CommandStatus::Succeeded, Ok(value))
            }
            Execution::Completed(Err(source)) => {
                if self.is_ignored(command, breaker_key, &source, execute_millis) {
                    (
                        CommandStatus::Ignored,
                        Err(CallError::Ignored {
                            command: name.to_string(),
                            source,
                        }),
                    )
                } else {
                    self.record_failure(breaker.as_deref(), name);
                    (
                        CommandStatus::Faulted,
                        Err(CallError::ExecutionFailed {
                            command: name.to_string(),
                            breaker: breaker_key.clone(),
                            elapsed_millis: execute_millis,
                            source,
                        }),
                    )
                }
            }
            Execution::DeadlineExceeded => {
                let timeout = timeout.unwrap_or_default();
                let error = CallError::TimedOut {
                    command: name.to_string(),
                    breaker: breaker_key.clone(),
                    timeout,
                    elapsed_millis: execute_millis,
                };
                let marker = DeadlineExceeded { timeout };
                if self.is_ignored(command, breaker_key, &marker, execute_millis) {
                    (CommandStatus::Ignored, Err(error))
                } else {
                    self.record_failure(breaker.as_deref(), name);
                    (CommandStatus::TimedOut, Err(error))
                }
            }
        };

        self.leave_bulkhead(&bulkhead, name, permit);

        let result = match (outcome, options.fallback) {
            (Err(error), Some(fallback))
                if matches!(status, CommandStatus::Faulted | CommandStatus::TimedOut) =>
            {
                debug!(command = name, %status, "Running fallback");
                fallback(error)
            }
            (outcome, _) => outcome,
        };

        self.report_invoked(
            command,
            invoke_started_at,
            execute_millis,
            status,
            options.failure_action,
        );
        result
    }

    fn resolve_timeout<E>(
        &self,
        command: &Command,
        requested: Option<Duration>,
        global: &GlobalConfig,
    ) -> Result<Option<Duration>, CallError<E>> {
        if global.ignore_timeouts {
            return Ok(None);
        }

        let timeout = requested
            .or_else(|| self.config.command_timeout(command.name()))
            .unwrap_or(command.default_timeout());

        if timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout {
                command: command.name().to_string(),
            }
            .into());
        }
        Ok(Some(timeout))
    }

    fn is_ignored(
        &self,
        command: &Command,
        breaker: &Key,
        error: &dyn Any,
        elapsed_millis: u64,
    ) -> bool {
        let ctx = FailureContext {
            command: command.name(),
            breaker,
            error,
            elapsed_millis,
        };
        self.ignore.is_ignored(&ctx)
    }

    /// Bookkeeping for work that panicked: counted as a fault, then the
    /// permit is returned and the call reported before the unwind resumes
    fn abandon(
        &self,
        command: &Command,
        admitted: Admitted,
        execute_millis: u64,
        failure_action: FailureAction,
    ) {
        let Admitted {
            invoke_started_at,
            breaker,
            bulkhead,
            permit,
            ..
        } = admitted;
        let name = command.name();

        error!(command = name, "Protected work panicked");
        self.record_failure(breaker.as_deref(), name);
        self.leave_bulkhead(&bulkhead, name, permit);
        self.report_invoked(
            command,
            invoke_started_at,
            execute_millis,
            CommandStatus::Faulted,
            failure_action,
        );
    }

    fn record_failure(&self, breaker: Option<&CircuitBreaker>, command: &str) {
        if let Some(breaker) = breaker {
            breaker.metrics().increment(OutcomeKind::Failure);
            self.events.emit("breaker_failure_count", |s| {
                s.breaker_failure_count(breaker.key(), command)
            });
        }
    }

    fn leave_bulkhead(&self, bulkhead: &Key, command: &str, permit: BulkheadGuard) {
        drop(permit);
        self.events
            .emit("leave_bulkhead", |s| s.leave_bulkhead(bulkhead, command));
    }

    fn report_invoked(
        &self,
        command: &Command,
        invoke_started_at: u64,
        execute_millis: u64,
        status: CommandStatus,
        failure_action: FailureAction,
    ) {
        let invoke_millis = self.clock.now_millis().saturating_sub(invoke_started_at);
        self.events.emit("command_invoked", |s| {
            s.command_invoked(
                command.name(),
                invoke_millis,
                execute_millis,
                status,
                failure_action,
            )
        });
    }
}

/// Gauge computation must never fail the reporter
fn compute_gauge<G>(component: &'static str, key: &Key, compute: impl FnOnce() -> G) -> Option<G> {
    match catch_unwind(AssertUnwindSafe(compute)) {
        Ok(gauge) => Some(gauge),
        Err(_) => {
            error!(component, key = %key, "Gauge computation panicked");
            None
        }
    }
}
