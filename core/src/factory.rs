//! Key-scoped registries of breakers and bulkheads
//!
//! Each key gets exactly one breaker and one bulkhead holder for the life of
//! the process. Creation is optimistic: racing threads may each build a
//! candidate, but only the first insert is published and every caller gets
//! that canonical instance. Candidates are side-effect free until they win.

use crate::bulkhead::BulkheadHolder;
use crate::circuit::CircuitBreaker;
use crate::clock::Clock;
use crate::config::ConfigSource;
use crate::errors::ValidationError;
use crate::events::Events;
use crate::key::Key;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// One [`CircuitBreaker`] per key
#[derive(Debug)]
pub struct BreakerFactory {
    breakers: DashMap<Key, Arc<CircuitBreaker>>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    events: Events,
}

impl BreakerFactory {
    pub fn new(config: Arc<dyn ConfigSource>, clock: Arc<dyn Clock>, events: Events) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
            events,
        }
    }

    /// Canonical breaker for `key`, creating it on first use
    pub fn get_breaker(&self, key: &Key) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }

        let candidate = Arc::new(CircuitBreaker::new(
            key.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
            self.events.clone(),
        ));

        let canonical = Arc::clone(
            self.breakers
                .entry(key.clone())
                .or_insert(candidate)
                .value(),
        );
        debug!(breaker = %key, "Breaker registered");
        canonical
    }

    /// Existing breaker for `key`, without creating one
    pub fn find(&self, key: &Key) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Every breaker created so far
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// One [`BulkheadHolder`] per key, kept in sync with `max_concurrent` changes
#[derive(Debug)]
pub struct BulkheadFactory {
    holders: DashMap<Key, Arc<BulkheadHolder>>,
    config: Arc<dyn ConfigSource>,
}

impl BulkheadFactory {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            holders: DashMap::new(),
            config,
        }
    }

    /// Canonical holder for `key`, creating it on first use.
    ///
    /// Fails when the key's configured capacity is negative and no holder
    /// exists yet.
    pub fn get_bulkhead(&self, key: &Key) -> Result<Arc<BulkheadHolder>, ValidationError> {
        if let Some(existing) = self.holders.get(key) {
            return Ok(Arc::clone(existing.value()));
        }

        let max_concurrent = self.config.bulkhead(key).max_concurrent;
        let candidate = Arc::new(BulkheadHolder::new(key.clone(), max_concurrent)?);

        let canonical = Arc::clone(
            self.holders
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(&candidate))
                .value(),
        );

        // Only the winner subscribes; losing candidates are dropped untouched
        if Arc::ptr_eq(&canonical, &candidate) {
            self.subscribe(&canonical);
            debug!(bulkhead = %key, max_concurrent, "Bulkhead registered");
        }

        Ok(canonical)
    }

    /// Existing holder for `key`, without creating one
    pub fn find(&self, key: &Key) -> Option<Arc<BulkheadHolder>> {
        self.holders.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Every holder created so far
    pub fn all(&self) -> Vec<Arc<BulkheadHolder>> {
        self.holders
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    fn subscribe(&self, holder: &Arc<BulkheadHolder>) {
        let weak: Weak<BulkheadHolder> = Arc::downgrade(holder);
        self.config.on_max_concurrent_change(
            holder.key(),
            Arc::new(move |max_concurrent| {
                if let Some(holder) = weak.upgrade() {
                    holder.update_max_concurrent(max_concurrent);
                }
            }),
        );

        // A change published between construction and subscription would be lost
        let current = self.config.bulkhead(holder.key()).max_concurrent;
        if usize::try_from(current).ok() != Some(holder.max_concurrent()) {
            holder.update_max_concurrent(current);
        }
    }
}
