//! Bulkhead implementation for concurrency limiting
//!
//! This module provides a semaphore-based bulkhead and the per-key holder
//! that swaps in a resized semaphore when `max_concurrent` is reconfigured.

use crate::errors::ValidationError;
use crate::key::Key;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Bulkheading prevents one slow dependency from soaking up every calling
/// thread by rejecting calls once a maximum concurrency is reached.
/// Acquisition never blocks.
#[derive(Debug)]
pub struct SemaphoreBulkhead {
    /// Maximum number of concurrent permits
    limit: usize,
    /// Current number of acquired permits
    acquired: AtomicUsize,
}

impl SemaphoreBulkhead {
    /// Create a new bulkhead semaphore with the given concurrency limit
    ///
    /// A limit of 0 is valid and rejects every call.
    pub fn new(max_concurrent: i64) -> Result<Self, ValidationError> {
        let limit = usize::try_from(max_concurrent).map_err(|_| {
            ValidationError::NegativeCapacity {
                value: max_concurrent,
            }
        })?;

        Ok(Self {
            limit,
            acquired: AtomicUsize::new(0),
        })
    }

    /// Try to acquire a permit without blocking
    ///
    /// Returns `Some(BulkheadGuard)` if a permit was acquired, or `None` if
    /// the bulkhead is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        let mut current = self.acquired.load(Ordering::Acquire);

        loop {
            if current >= self.limit {
                return None;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BulkheadGuard {
                        semaphore: Arc::clone(self),
                    });
                }
                Err(actual) => {
                    // Another thread modified the counter, try again
                    current = actual;
                }
            }
        }
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.acquired())
    }

    /// Release a permit (called by BulkheadGuard on drop)
    fn release(&self) {
        self.acquired.fetch_sub(1, Ordering::Release);
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// The guard pins the semaphore instance it was acquired from, so a permit
/// taken before a resize is returned to the old instance.
#[derive(Debug)]
pub struct BulkheadGuard {
    semaphore: Arc<SemaphoreBulkhead>,
}

impl BulkheadGuard {
    /// Limit of the semaphore this permit came from
    pub fn limit(&self) -> usize {
        self.semaphore.limit()
    }
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Long-lived, per-key handle to the current bulkhead instance
///
/// The holder is never replaced for the lifetime of its key; only the
/// semaphore inside it is swapped when capacity is reconfigured.
#[derive(Debug)]
pub struct BulkheadHolder {
    key: Key,
    current: ArcSwap<SemaphoreBulkhead>,
}

impl BulkheadHolder {
    pub fn new(key: Key, max_concurrent: i64) -> Result<Self, ValidationError> {
        let semaphore = SemaphoreBulkhead::new(max_concurrent)?;
        Ok(Self {
            key,
            current: ArcSwap::from_pointee(semaphore),
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Try to enter the current semaphore without blocking
    pub fn try_enter(&self) -> Option<BulkheadGuard> {
        self.current.load_full().try_acquire()
    }

    /// Free permits on the current semaphore
    pub fn count_available(&self) -> usize {
        self.current.load().available()
    }

    /// Capacity of the current semaphore
    pub fn max_concurrent(&self) -> usize {
        self.current.load().limit()
    }

    /// Replace the semaphore with one sized to `max_concurrent`.
    ///
    /// Invalid values are logged and ignored; the previous semaphore stays live.
    pub fn update_max_concurrent(&self, max_concurrent: i64) {
        match SemaphoreBulkhead::new(max_concurrent) {
            Ok(semaphore) => {
                let previous = self.current.swap(Arc::new(semaphore));
                info!(
                    bulkhead = %self.key,
                    from = previous.limit(),
                    to = max_concurrent,
                    "Bulkhead resized"
                );
            }
            Err(e) => {
                error!(
                    bulkhead = %self.key,
                    value = max_concurrent,
                    error = %e,
                    "Ignoring invalid bulkhead capacity; keeping current bulkhead"
                );
            }
        }
    }
}
