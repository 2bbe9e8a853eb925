//! Configuration consumed by the isolation pipeline
//!
//! The pipeline never loads configuration itself. It reads typed settings
//! through [`ConfigSource`] on every decision, so a source that changes its
//! answers reconfigures breakers and timeouts on the next call. Bulkhead
//! capacity is the one setting pushed through a change subscription, because
//! resizing swaps the live semaphore.

use crate::key::Key;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Process-wide switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Kill switch. When false, work runs directly with no isolation at all
    pub enabled: bool,
    /// Suppress deadline enforcement (local and test environments)
    pub ignore_timeouts: bool,
    /// When false, breaker admission and breaker bookkeeping are skipped
    pub use_circuit_breakers: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_timeouts: false,
            use_circuit_breakers: true,
        }
    }
}

/// Per-breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Operations required in the window before the error rate is considered
    pub minimum_operations: u64,

    /// Length of the metrics window; counters reset once it elapses
    pub window_millis: u64,

    /// Error percentage (0-100) at or above which the breaker trips
    pub threshold_percentage: u32,

    /// Wait after a trip (or a failed trial) before the next single test call
    pub tripped_duration_millis: u64,

    /// Reject every call regardless of metrics
    pub force_tripped: bool,

    /// Allow every call regardless of metrics (still tracks trips for gauges)
    pub force_fixed: bool,

    /// How long a computed metrics snapshot stays cached
    pub snapshot_ttl_millis: u64,

    /// Jitter factor for the tripped wait (0.0 = exact wait, 1.0 = full jitter).
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub trial_jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            minimum_operations: 10,
            window_millis: 30_000,
            threshold_percentage: 50,
            tripped_duration_millis: 10_000,
            force_tripped: false,
            force_fixed: false,
            snapshot_ttl_millis: 1_000,
            trial_jitter_factor: 0.0,
        }
    }
}

/// Per-bulkhead settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Permits available to concurrent calls. Signed so a bad value coming
    /// from a config system can be represented and rejected
    pub max_concurrent: i64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

/// Callback fired with the new `max_concurrent` value for a bulkhead key
pub type MaxConcurrentCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Source of live settings for the isolation pipeline
pub trait ConfigSource: Send + Sync + std::fmt::Debug {
    /// Process-wide switches
    fn global(&self) -> GlobalConfig;

    /// Settings for one breaker
    fn breaker(&self, key: &Key) -> BreakerConfig;

    /// Settings for one bulkhead
    fn bulkhead(&self, key: &Key) -> BulkheadConfig;

    /// Configured timeout for a command name, overriding its default
    fn command_timeout(&self, _command: &str) -> Option<Duration> {
        None
    }

    /// Subscribe to `max_concurrent` changes for a bulkhead key.
    ///
    /// Sources that never change may ignore subscriptions.
    fn on_max_concurrent_change(&self, _key: &Key, _callback: MaxConcurrentCallback) {}
}

/// Serializable settings document for [`MemoryConfig`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub global: GlobalConfig,
    pub breaker_defaults: BreakerConfig,
    pub bulkhead_defaults: BulkheadConfig,
    pub breakers: HashMap<Key, BreakerConfig>,
    pub bulkheads: HashMap<Key, BulkheadConfig>,
    pub command_timeouts_millis: HashMap<String, u64>,
}

/// Thread-safe in-memory config source with per-key overrides
#[derive(Default)]
pub struct MemoryConfig {
    settings: RwLock<Settings>,
    subscribers: RwLock<HashMap<Key, Vec<MaxConcurrentCallback>>>,
}

impl MemoryConfig {
    /// Create a source where every key uses the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source from a deserialized settings document
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of the current settings document
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn set_global(&self, global: GlobalConfig) {
        self.settings.write().global = global;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.write().global.enabled = enabled;
    }

    pub fn set_ignore_timeouts(&self, ignore: bool) {
        self.settings.write().global.ignore_timeouts = ignore;
    }

    pub fn set_use_circuit_breakers(&self, use_breakers: bool) {
        self.settings.write().global.use_circuit_breakers = use_breakers;
    }

    pub fn set_breaker_defaults(&self, config: BreakerConfig) {
        self.settings.write().breaker_defaults = config;
    }

    /// Override the settings of one breaker
    pub fn set_breaker(&self, key: &Key, config: BreakerConfig) {
        self.settings.write().breakers.insert(key.clone(), config);
    }

    /// Edit one breaker's settings in place, starting from its current values
    pub fn update_breaker(&self, key: &Key, edit: impl FnOnce(&mut BreakerConfig)) {
        let mut settings = self.settings.write();
        let mut config = settings
            .breakers
            .get(key)
            .cloned()
            .unwrap_or_else(|| settings.breaker_defaults.clone());
        edit(&mut config);
        settings.breakers.insert(key.clone(), config);
    }

    /// Change a bulkhead's capacity and notify its subscribers.
    ///
    /// The value is stored even when negative; validation happens at the
    /// bulkhead, which keeps its previous capacity on a bad value.
    pub fn set_max_concurrent(&self, key: &Key, max_concurrent: i64) {
        self.settings
            .write()
            .bulkheads
            .insert(key.clone(), BulkheadConfig { max_concurrent });

        // Clone out so callbacks run without holding the lock
        let callbacks = self
            .subscribers
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default();

        debug!(
            bulkhead = %key,
            max_concurrent,
            subscribers = callbacks.len(),
            "Bulkhead capacity changed"
        );

        for callback in callbacks {
            callback(max_concurrent);
        }
    }

    /// Store a per-command timeout at millisecond precision.
    ///
    /// Sub-millisecond remainders round up, so a non-zero timeout never
    /// becomes a zero one.
    pub fn set_command_timeout(&self, command: &str, timeout: Duration) {
        let millis = u64::try_from(timeout.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX);
        self.settings
            .write()
            .command_timeouts_millis
            .insert(command.to_string(), millis);
    }
}

impl ConfigSource for MemoryConfig {
    fn global(&self) -> GlobalConfig {
        self.settings.read().global
    }

    fn breaker(&self, key: &Key) -> BreakerConfig {
        let settings = self.settings.read();
        settings
            .breakers
            .get(key)
            .cloned()
            .unwrap_or_else(|| settings.breaker_defaults.clone())
    }

    fn bulkhead(&self, key: &Key) -> BulkheadConfig {
        let settings = self.settings.read();
        settings
            .bulkheads
            .get(key)
            .copied()
            .unwrap_or(settings.bulkhead_defaults)
    }

    fn command_timeout(&self, command: &str) -> Option<Duration> {
        self.settings
            .read()
            .command_timeouts_millis
            .get(command)
            .map(|millis| Duration::from_millis(*millis))
    }

    fn on_max_concurrent_change(&self, key: &Key, callback: MaxConcurrentCallback) {
        self.subscribers
            .write()
            .entry(key.clone())
            .or_default()
            .push(callback);
    }
}

impl std::fmt::Debug for MemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConfig")
            .field("settings", &*self.settings.read())
            .field("subscribed_keys", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn key(name: &str) -> Key {
        Key::new(name).unwrap()
    }

    #[test]
    fn test_defaults_apply_to_unknown_keys() {
        let config = MemoryConfig::new();

        assert_eq!(config.global(), GlobalConfig::default());
        assert_eq!(config.breaker(&key("anything")), BreakerConfig::default());
        assert_eq!(config.bulkhead(&key("anything")).max_concurrent, 10);
        assert_eq!(config.command_timeout("group.Command"), None);
    }

    #[test]
    fn test_command_timeout_rounds_up_to_millis() {
        let config = MemoryConfig::new();

        config.set_command_timeout("payments.Charge", Duration::from_micros(500));
        config.set_command_timeout("payments.Refund", Duration::from_micros(2_001));
        config.set_command_timeout("payments.Void", Duration::MAX);

        assert_eq!(
            config.command_timeout("payments.Charge"),
            Some(Duration::from_millis(1))
        );
        assert_eq!(
            config.command_timeout("payments.Refund"),
            Some(Duration::from_millis(3))
        );
        assert_eq!(
            config.command_timeout("payments.Void"),
            Some(Duration::from_millis(u64::MAX))
        );
    }

    #[test]
    fn test_per_key_overrides() {
        let config = MemoryConfig::new();

        config.update_breaker(&key("payments"), |c| c.minimum_operations = 3);

        assert_eq!(config.breaker(&key("payments")).minimum_operations, 3);
        assert_eq!(config.breaker(&key("payments")).threshold_percentage, 50);
        assert_eq!(config.breaker(&key("inventory")).minimum_operations, 10);
    }

    #[test]
    fn test_max_concurrent_change_notifies_subscribers() {
        let config = MemoryConfig::new();
        let seen = Arc::new(AtomicI64::new(-1));
        let seen_clone = seen.clone();

        config.on_max_concurrent_change(
            &key("search"),
            Arc::new(move |value| seen_clone.store(value, Ordering::SeqCst)),
        );

        config.set_max_concurrent(&key("other"), 3);
        assert_eq!(seen.load(Ordering::SeqCst), -1);

        config.set_max_concurrent(&key("search"), 25);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert_eq!(config.bulkhead(&key("search")).max_concurrent, 25);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let json = r#"{
            "global": { "ignore_timeouts": true },
            "breaker_defaults": { "threshold_percentage": 75 },
            "breakers": { "payments": { "minimum_operations": 2 } },
            "bulkheads": { "payments": { "max_concurrent": 4 } },
            "command_timeouts_millis": { "payments.Charge": 2500 }
        }"#;

        let settings: Settings = serde_json::from_str(json).unwrap();
        let config = MemoryConfig::from_settings(settings);

        let global = config.global();
        assert!(global.enabled);
        assert!(global.ignore_timeouts);
        assert!(global.use_circuit_breakers);

        assert_eq!(config.breaker(&key("inventory")).threshold_percentage, 75);
        let payments = config.breaker(&key("payments"));
        assert_eq!(payments.minimum_operations, 2);
        // Per-key documents fill gaps from BreakerConfig::default, not breaker_defaults
        assert_eq!(payments.threshold_percentage, 50);

        assert_eq!(config.bulkhead(&key("payments")).max_concurrent, 4);
        assert_eq!(
            config.command_timeout("payments.Charge"),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_settings_reject_invalid_keys() {
        let json = r#"{ "breakers": { "x": {} } }"#;
        let result: Result<Settings, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
