//! Error types for isolated calls

use std::time::Duration;
use thiserror::Error;

use crate::key::Key;

/// Bad input detected at construction time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Key names must start with a letter and be at least 3 alphanumeric/underscore chars
    #[error("invalid key name '{name}': must match ^[A-Za-z][A-Za-z0-9_]{{2,}}$")]
    InvalidKey { name: String },
    /// Command timeouts must be greater than zero
    #[error("command '{command}' timeout must be greater than zero")]
    InvalidTimeout { command: String },
    /// Bulkhead capacity cannot be negative
    #[error("bulkhead max concurrent must be >= 0 (got {value})")]
    NegativeCapacity { value: i64 },
    /// A command instance was invoked a second time
    #[error("command '{command}' has already been invoked; create a new instance per call")]
    AlreadyInvoked { command: String },
}

/// Errors that can occur during an isolated call.
///
/// `E` is the error type of the protected work itself. Rejections
/// (`BulkheadRejected`, `BreakerRejected`) never ran the work; the remaining
/// variants carry enough context to tell "my code failed" apart from "the
/// isolation layer turned me away".
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The call could not be set up
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No bulkhead permit was available
    #[error("command '{command}' rejected: bulkhead '{bulkhead}' is full (max concurrent: {max_concurrent})")]
    BulkheadRejected {
        command: String,
        bulkhead: Key,
        max_concurrent: usize,
    },
    /// The breaker is tripped, the dependency is presumed down
    #[error("command '{command}' rejected: breaker '{breaker}' is tripped")]
    BreakerRejected { command: String, breaker: Key },
    /// The work returned an error
    #[error("command '{command}' failed after {elapsed_millis}ms (breaker '{breaker}'): {source}")]
    ExecutionFailed {
        command: String,
        breaker: Key,
        elapsed_millis: u64,
        #[source]
        source: E,
    },
    /// The work did not complete before its deadline
    #[error("command '{command}' timed out after {elapsed_millis}ms (timeout {timeout:?}, breaker '{breaker}')")]
    TimedOut {
        command: String,
        breaker: Key,
        timeout: Duration,
        elapsed_millis: u64,
    },
    /// The work returned an error the ignore policy excludes from breaker bookkeeping
    #[error("command '{command}' failed with an ignored error: {source}")]
    Ignored {
        command: String,
        #[source]
        source: E,
    },
    /// The fallback itself failed
    #[error("fallback for command '{command}' failed: {source}")]
    FallbackFailed {
        command: String,
        #[source]
        source: E,
    },
    /// Isolation is globally disabled; the work's own error, untouched
    #[error("{0}")]
    Bypassed(E),
}

impl<E> CallError<E> {
    /// True when the isolation layer refused to run the work
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CallError::BulkheadRejected { .. } | CallError::BreakerRejected { .. }
        )
    }

    /// True when the work hit its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::TimedOut { .. })
    }

    /// Name of the command this error belongs to, if any
    pub fn command(&self) -> Option<&str> {
        match self {
            CallError::BulkheadRejected { command, .. }
            | CallError::BreakerRejected { command, .. }
            | CallError::ExecutionFailed { command, .. }
            | CallError::TimedOut { command, .. }
            | CallError::Ignored { command, .. }
            | CallError::FallbackFailed { command, .. } => Some(command),
            CallError::Validation(ValidationError::AlreadyInvoked { command })
            | CallError::Validation(ValidationError::InvalidTimeout { command }) => Some(command),
            CallError::Validation(_) | CallError::Bypassed(_) => None,
        }
    }

    /// The work's (or fallback's) own error, when there is one
    pub fn into_source(self) -> Option<E> {
        match self {
            CallError::ExecutionFailed { source, .. }
            | CallError::Ignored { source, .. }
            | CallError::FallbackFailed { source, .. }
            | CallError::Bypassed(source) => Some(source),
            _ => None,
        }
    }
}
