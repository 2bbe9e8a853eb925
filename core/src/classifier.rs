//! Failure classification for exception filtering
//!
//! This module decides which failures are excluded from breaker and metrics
//! bookkeeping. An ignored failure still propagates to the caller; it just
//! does not count against the dependency.

use crate::key::Key;
use std::any::{Any, TypeId};
use std::time::Duration;

/// Marker error handed to the ignore policy when a call hits its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub timeout: Duration,
}

/// Context provided to ignore policies for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Command name
    pub command: &'a str,
    /// Breaker the failure would count against
    pub breaker: &'a Key,
    /// The error that occurred (can be downcast to specific types).
    /// For timeouts this is a [`DeadlineExceeded`]
    pub error: &'a dyn Any,
    /// Duration of the failed call in milliseconds
    pub elapsed_millis: u64,
}

/// Trait for classifying failures - determines if an error is kept out of
/// the breaker's failure count
///
/// # Examples
///
/// ```rust
/// use isolation_machines::{FailureContext, IgnorePolicy};
///
/// #[derive(Debug)]
/// struct NotFound;
///
/// #[derive(Debug)]
/// struct IgnoreNotFound;
///
/// impl IgnorePolicy for IgnoreNotFound {
///     fn is_ignored(&self, ctx: &FailureContext<'_>) -> bool {
///         // A missing record is the caller's problem, not the dependency's
///         ctx.error.downcast_ref::<NotFound>().is_some()
///     }
/// }
/// ```
pub trait IgnorePolicy: Send + Sync + std::fmt::Debug {
    /// Returns `true` to keep this failure out of metrics and breaker state
    fn is_ignored(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default policy: every failure counts
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverIgnore;

impl IgnorePolicy for NeverIgnore {
    fn is_ignored(&self, _ctx: &FailureContext<'_>) -> bool {
        false
    }
}

/// Ignore-list keyed by concrete error type
#[derive(Debug, Clone, Default)]
pub struct IgnoredTypes {
    types: Vec<(TypeId, &'static str)>,
}

impl IgnoredTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `T` to the ignore-list
    pub fn ignore<T: Any>(mut self) -> Self {
        let id = TypeId::of::<T>();
        if !self.types.iter().any(|(t, _)| *t == id) {
            self.types.push((id, std::any::type_name::<T>()));
        }
        self
    }

    /// Whether the concrete type behind `error` is on the list
    pub fn contains(&self, error: &dyn Any) -> bool {
        let id = Any::type_id(error);
        self.types.iter().any(|(t, _)| *t == id)
    }
}

impl IgnorePolicy for IgnoredTypes {
    fn is_ignored(&self, ctx: &FailureContext<'_>) -> bool {
        self.contains(ctx.error)
    }
}

/// Predicate-based policy using a closure
pub struct PredicateIgnore<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateIgnore<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> IgnorePolicy for PredicateIgnore<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn is_ignored(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateIgnore<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateIgnore")
            .field("predicate", &"<closure>")
            .finish()
    }
}
