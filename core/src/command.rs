//! Commands, per-call options and call results

use crate::errors::{CallError, ValidationError};
use crate::key::Key;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A named, protected operation against one dependency.
///
/// The command's name is `"<group>.<name>"`. Breaker and bulkhead keys
/// default to the group key. A command instance may be invoked once; build
/// a new one per call.
#[derive(Debug)]
pub struct Command {
    name: String,
    group: Key,
    breaker_key: Key,
    bulkhead_key: Key,
    default_timeout: Duration,
    invoked: AtomicBool,
}

impl Command {
    pub fn new(
        group: Key,
        name: &str,
        default_timeout: Duration,
    ) -> Result<Self, ValidationError> {
        let name = format!("{}.{}", group, name);
        if default_timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout { command: name });
        }

        Ok(Self {
            name,
            breaker_key: group.clone(),
            bulkhead_key: group.clone(),
            group,
            default_timeout,
            invoked: AtomicBool::new(false),
        })
    }

    /// Route the command through a different breaker than its group's
    pub fn with_breaker_key(mut self, key: Key) -> Self {
        self.breaker_key = key;
        self
    }

    /// Route the command through a different bulkhead than its group's
    pub fn with_bulkhead_key(mut self, key: Key) -> Self {
        self.bulkhead_key = key;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &Key {
        &self.group
    }

    pub fn breaker_key(&self) -> &Key {
        &self.breaker_key
    }

    pub fn bulkhead_key(&self) -> &Key {
        &self.bulkhead_key
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Claim the single invocation this instance allows
    pub(crate) fn mark_invoked(&self) -> Result<(), ValidationError> {
        if self.invoked.swap(true, Ordering::AcqRel) {
            return Err(ValidationError::AlreadyInvoked {
                command: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Cooperative cancellation handed to the protected work.
///
/// Synchronous work should poll [`CallToken::is_cancelled`]; asynchronous
/// work can await [`CallToken::cancelled`]. Cancellation is never forced.
#[derive(Debug, Clone)]
pub struct CallToken {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallToken {
    /// Token that cancels once `timeout` has elapsed.
    ///
    /// `None`, or a timeout too large to represent as an instant (such as
    /// `Duration::MAX`), means no deadline.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    /// Token that is never cancelled
    pub fn none() -> Self {
        Self::with_timeout(None)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the deadline has passed or the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the deadline passes or the call is cancelled
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// What the caller wants done with failures, recorded on the invoked event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureAction {
    /// Failures come back as `Err`
    #[default]
    Throw,
    /// Failures come back inside a [`CallResult`]
    Return,
}

impl fmt::Display for FailureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureAction::Throw => f.write_str("throw"),
            FailureAction::Return => f.write_str("return"),
        }
    }
}

/// Terminal status of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Succeeded,
    Faulted,
    TimedOut,
    Ignored,
    RejectedByBulkhead,
    RejectedByBreaker,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Succeeded => "succeeded",
            CommandStatus::Faulted => "faulted",
            CommandStatus::TimedOut => "timed_out",
            CommandStatus::Ignored => "ignored",
            CommandStatus::RejectedByBulkhead => "rejected_by_bulkhead",
            CommandStatus::RejectedByBreaker => "rejected_by_breaker",
        };
        f.write_str(name)
    }
}

/// Type alias for fallback function.
///
/// Receives the failure and may recover with a value, return its own
/// `CallError::FallbackFailed`, or hand the original failure back.
pub type FallbackFn<T, E> = Box<dyn FnOnce(CallError<E>) -> Result<T, CallError<E>> + Send>;

/// Options for one invocation
pub struct CallOptions<T, E> {
    /// Called when the work fails or times out (not on rejections or ignored errors)
    pub fallback: Option<FallbackFn<T, E>>,
    /// Overrides configured and default timeouts for this call
    pub timeout: Option<Duration>,
    pub failure_action: FailureAction,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self {
            fallback: None,
            timeout: None,
            failure_action: FailureAction::Throw,
        }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(CallError<E>) -> Result<T, CallError<E>> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn failure_action(mut self, action: FailureAction) -> Self {
        self.failure_action = action;
        self
    }
}

impl<T, E> fmt::Debug for CallOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("fallback", &self.fallback.is_some())
            .field("timeout", &self.timeout)
            .field("failure_action", &self.failure_action)
            .finish()
    }
}

/// Outcome of a call in "return" mode: never an `Err`, always inspectable
#[derive(Debug)]
pub struct CallResult<T, E> {
    result: Result<T, CallError<E>>,
}

impl<T, E> CallResult<T, E> {
    pub fn was_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CallError<E>> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, CallError<E>> {
        self.result
    }
}

impl<T, E> From<Result<T, CallError<E>>> for CallResult<T, E> {
    fn from(result: Result<T, CallError<E>>) -> Self {
        Self { result }
    }
}
