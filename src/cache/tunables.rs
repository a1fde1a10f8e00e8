//! Periodic re-read of the cache intervals from host configuration.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use log::{debug, info};

use super::rule_cache::{CacheConfig, RuleCache};
use crate::types::now_ms;

/// Tunable holding the refresh-after-write interval in milliseconds.
pub const REFRESH_INTERVAL_KEY: &str = "ageoff.cache.update.interval.ms";
/// Tunable holding the expire-after-access interval in milliseconds.
pub const EXPIRATION_INTERVAL_KEY: &str = "ageoff.cache.expiration.interval.ms";

/// Host-provided key/value configuration.
pub trait TunableSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl TunableSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// In-memory tunables that can be changed at runtime.
#[derive(Debug, Default)]
pub struct StaticTunables {
    values: RwLock<HashMap<String, String>>,
}

impl StaticTunables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }
}

impl TunableSource for StaticTunables {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Configuration for the tunables watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between tunable checks
    pub check_interval: Duration,
    /// Whether the watcher runs at all
    pub enabled: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            enabled: true,
        }
    }
}

/// Keeps a [`RuleCache`]'s intervals in line with the host tunables.
///
/// Each check re-reads both intervals, reconfigures the cache when either
/// changed, and sweeps entries that have been idle past expiration.
pub struct TunablesWatcher {
    cache: Arc<RuleCache>,
    tunables: Arc<dyn TunableSource>,
    config: WatcherConfig,
    /// Timestamp of the last completed check
    last_check_at: RwLock<i64>,
}

impl TunablesWatcher {
    /// Creates a watcher for `cache`.
    ///
    /// # Arguments
    /// - `cache`: cache whose intervals follow the tunables
    /// - `tunables`: host tunables, read on every check
    /// - `config`: check interval and enabled state
    ///
    /// # Returns
    /// A watcher with `last_check` set to the current time. It does nothing
    /// until `start` or `check_once` is called.
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use ageoff::cache::{StaticTunables, TunablesWatcher, WatcherConfig};
    /// # fn build(cache: Arc<ageoff::RuleCache>) {
    ///
    /// let tunables = Arc::new(StaticTunables::new());
    /// let config = WatcherConfig {
    ///     check_interval: Duration::from_secs(30),
    ///     enabled: true,
    /// };
    /// let watcher = Arc::new(TunablesWatcher::new(cache, tunables, config));
    /// # }
    /// ```
    pub fn new(cache: Arc<RuleCache>, tunables: Arc<dyn TunableSource>, config: WatcherConfig) -> Self {
        Self {
            cache,
            tunables,
            config,
            last_check_at: RwLock::new(now_ms()),
        }
    }

    /// Returns the timestamp of the last completed check.
    ///
    /// # Returns
    /// Milliseconds since the UNIX epoch of the last check, or the creation
    /// time if no check has run yet.
    pub fn last_check(&self) -> i64 {
        *self.last_check_at.read()
    }

    /// Runs one check. Returns `true` when the cache was reconfigured.
    pub fn check_once(&self) -> bool {
        let wanted = CacheConfig::from_tunables(self.tunables.as_ref());
        let changed = self.cache.reconfigure(wanted);
        let evicted = self.cache.evict_expired();
        if evicted > 0 {
            debug!("Tunables check evicted {} idle rule sets", evicted);
        }
        *self.last_check_at.write() = now_ms();
        changed
    }

    /// Runs checks on the configured interval until the task is dropped.
    ///
    /// The first check runs one interval after start. Each check reconfigures
    /// the cache if the tunables changed and evicts idle entries.
    ///
    /// # Returns
    /// Immediately when the watcher is disabled; otherwise never.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::sync::Arc;
    /// # use ageoff::cache::TunablesWatcher;
    /// # fn spawn(watcher: Arc<TunablesWatcher>) {
    /// tokio::spawn(watcher.start());
    /// # }
    /// ```
    pub async fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Tunables watcher is disabled, skipping");
            return;
        }

        info!(
            "Starting tunables watcher with {}ms interval",
            self.config.check_interval.as_millis()
        );

        let mut ticker = interval(self.config.check_interval);
        loop {
            ticker.tick().await;
            self.check_once();
        }
    }
}
