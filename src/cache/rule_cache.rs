//! Keyed, time-bounded cache of compiled rule sets.
//!
//! # Read path
//!
//! A hit takes the map read lock, clones an `Arc<RuleSet>` and returns. It
//! never waits on a load or refresh of the same key.
//!
//! # Refresh-after-write
//!
//! Once an entry is older than `refresh_interval`, the next hit schedules a
//! recompilation on the injected tokio runtime (`spawn_blocking`, since
//! loaders do blocking I/O) and still returns the current snapshot. The new
//! snapshot is swapped in only when it compiles; a failed refresh is logged
//! and the previous snapshot stays.
//!
//! # Expire-after-access
//!
//! An entry not read for `expiration_interval` is dropped. The next read is
//! a cold load, performed by one caller while the others for that key wait.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use log::{debug, error, info, warn};

use super::tunables::{TunableSource, EXPIRATION_INTERVAL_KEY, REFRESH_INTERVAL_KEY};
use crate::error::ConfigError;
use crate::rules::RuleSource;
use crate::ruleset::RuleSet;

/// Produces the rule definitions of one configuration source.
///
/// Called on cold loads and background refreshes, never on the
/// per-record path. May block.
pub trait RuleLoader: Send + Sync {
    fn load(&self, source_id: &str) -> Result<RuleSource, ConfigError>;
}

impl<F> RuleLoader for F
where
    F: Fn(&str) -> Result<RuleSource, ConfigError> + Send + Sync,
{
    fn load(&self, source_id: &str) -> Result<RuleSource, ConfigError> {
        self(source_id)
    }
}

/// Cache intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Age after which the next access schedules a background recompilation
    pub refresh_interval: Duration,
    /// Idle time after which an entry is dropped
    pub expiration_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(5),
            expiration_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl CacheConfig {
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_expiration_interval(mut self, interval: Duration) -> Self {
        self.expiration_interval = interval;
        self
    }

    /// Reads both intervals (milliseconds) from host tunables.
    ///
    /// Missing keys keep the default; unparsable values are logged and keep
    /// the default too.
    pub fn from_tunables(tunables: &dyn TunableSource) -> Self {
        let defaults = Self::default();
        Self {
            refresh_interval: read_millis(tunables, REFRESH_INTERVAL_KEY, defaults.refresh_interval),
            expiration_interval: read_millis(
                tunables,
                EXPIRATION_INTERVAL_KEY,
                defaults.expiration_interval,
            ),
        }
    }
}

fn read_millis(tunables: &dyn TunableSource, key: &str, default: Duration) -> Duration {
    match tunables.get(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!("Ignoring unparsable tunable {}={:?}, using {:?}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct CacheEntry {
    rule_set: RwLock<Arc<RuleSet>>,
    written_at: RwLock<Instant>,
    accessed_at: RwLock<Instant>,
    refreshing: AtomicBool,
}

impl CacheEntry {
    fn new(rule_set: Arc<RuleSet>) -> Self {
        let now = Instant::now();
        Self {
            rule_set: RwLock::new(rule_set),
            written_at: RwLock::new(now),
            accessed_at: RwLock::new(now),
            refreshing: AtomicBool::new(false),
        }
    }

    fn is_expired(&self, now: Instant, config: &CacheConfig) -> bool {
        now.saturating_duration_since(*self.accessed_at.read()) >= config.expiration_interval
    }

    fn needs_refresh(&self, now: Instant, config: &CacheConfig) -> bool {
        now.saturating_duration_since(*self.written_at.read()) >= config.refresh_interval
    }

    fn replace(&self, rule_set: Arc<RuleSet>) {
        *self.rule_set.write() = rule_set;
        *self.written_at.write() = Instant::now();
    }
}

/// Cache of compiled rule sets keyed by configuration source id.
///
/// Owns its loader, runtime handle and intervals; there is no process-wide
/// instance. Share it between sessions with an `Arc`.
pub struct RuleCache {
    loader: Arc<dyn RuleLoader>,
    config: RwLock<CacheConfig>,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    /// Per-key cold-load locks
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    runtime: Handle,
    counters: Arc<Counters>,
}

impl RuleCache {
    /// Creates an empty cache.
    ///
    /// # Arguments
    /// - `loader`: source of rule definitions, called on cold loads and refreshes
    /// - `config`: refresh and expiration intervals
    /// - `runtime`: tokio runtime that runs background refreshes
    ///
    /// # Returns
    /// A cache with no entries. Nothing is loaded until the first `get_or_load`.
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use ageoff::{CacheConfig, ConfigError, RuleCache, RuleLoader, RuleSource};
    ///
    /// let runtime = tokio::runtime::Runtime::new()?;
    /// let loader: Arc<dyn RuleLoader> = Arc::new(|id: &str| -> Result<RuleSource, ConfigError> {
    ///     let text = std::fs::read_to_string(id).map_err(|e| ConfigError::Source {
    ///         source_id: id.to_string(),
    ///         message: e.to_string(),
    ///     })?;
    ///     RuleSource::from_json(&text)
    /// });
    /// let config = CacheConfig::default().with_refresh_interval(Duration::from_secs(30));
    /// let cache = RuleCache::new(loader, config, runtime.handle().clone());
    /// let rules = cache.get_or_load("/etc/ageoff/rules.json")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(loader: Arc<dyn RuleLoader>, config: CacheConfig, runtime: Handle) -> Self {
        info!(
            "Rule cache created: refresh={:?}, expiration={:?}",
            config.refresh_interval, config.expiration_interval
        );
        Self {
            loader,
            config: RwLock::new(config),
            entries: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
            runtime,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns the snapshot for `source_id`, loading it on a miss.
    ///
    /// # Errors
    /// Returns the loader or compile error of a failed cold load. Nothing is
    /// cached in that case.
    pub fn get_or_load(&self, source_id: &str) -> Result<Arc<RuleSet>, ConfigError> {
        if let Some(rule_set) = self.lookup(source_id) {
            Counters::bump(&self.counters.hits);
            return Ok(rule_set);
        }

        let lock = self.load_lock(source_id);
        let outcome = {
            let _guard = lock.lock();
            self.load_exclusive(source_id)
        };
        self.release_load_lock(source_id, &lock);
        outcome
    }

    /// Cold load of `source_id`; the caller holds its load lock.
    fn load_exclusive(&self, source_id: &str) -> Result<Arc<RuleSet>, ConfigError> {
        // Another caller may have finished the load while we waited.
        if let Some(rule_set) = self.lookup(source_id) {
            Counters::bump(&self.counters.hits);
            return Ok(rule_set);
        }
        Counters::bump(&self.counters.misses);

        match compile_source(self.loader.as_ref(), source_id) {
            Ok(rule_set) => {
                Counters::bump(&self.counters.loads);
                let rule_set = Arc::new(rule_set);
                self.entries.write().insert(
                    source_id.to_string(),
                    Arc::new(CacheEntry::new(Arc::clone(&rule_set))),
                );
                debug!("Loaded {} rules for '{}'", rule_set.len(), source_id);
                Ok(rule_set)
            }
            Err(e) => {
                Counters::bump(&self.counters.load_failures);
                error!("Failed to load rules for '{}': {}", source_id, e);
                Err(e)
            }
        }
    }

    /// Recompiles `source_id` on the calling thread.
    ///
    /// Returns `Ok(false)` when the key is not cached. On failure the old
    /// snapshot stays in place.
    pub fn refresh(&self, source_id: &str) -> Result<bool, ConfigError> {
        let Some(entry) = self.entries.read().get(source_id).cloned() else {
            return Ok(false);
        };
        refresh_entry(self.loader.as_ref(), &entry, source_id, &self.counters)?;
        Ok(true)
    }

    /// Drops every entry. Sessions holding snapshots keep them.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        let dropped = entries.len();
        entries.clear();
        info!("Rule cache invalidated ({} entries dropped)", dropped);
    }

    /// Drops `source_id`; returns whether it was cached.
    pub fn invalidate(&self, source_id: &str) -> bool {
        self.entries.write().remove(source_id).is_some()
    }

    /// Drops every entry idle for longer than the expiration interval.
    pub fn evict_expired(&self) -> usize {
        let config = self.config();
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, &config));
        let evicted = before - entries.len();
        if evicted > 0 {
            self.counters.expirations.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!("Evicted {} idle rule sets", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.entries.read().contains_key(source_id)
    }

    pub fn config(&self) -> CacheConfig {
        *self.config.read()
    }

    /// Applies new intervals. Existing entries are kept and judged against
    /// the new intervals on their next access.
    ///
    /// Returns `true` when the intervals changed.
    pub fn reconfigure(&self, config: CacheConfig) -> bool {
        let mut current = self.config.write();
        if *current == config {
            return false;
        }
        info!(
            "Rule cache intervals changed: refresh {:?} -> {:?}, expiration {:?} -> {:?}",
            current.refresh_interval,
            config.refresh_interval,
            current.expiration_interval,
            config.expiration_interval
        );
        *current = config;
        true
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            entries: self.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
        }
    }

    /// Cached snapshot, or `None` on a miss or expired entry.
    fn lookup(&self, source_id: &str) -> Option<Arc<RuleSet>> {
        let entry = self.entries.read().get(source_id).cloned()?;
        let config = self.config();
        let now = Instant::now();

        if entry.is_expired(now, &config) {
            let mut entries = self.entries.write();
            if entries
                .get(source_id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                entries.remove(source_id);
                Counters::bump(&self.counters.expirations);
                debug!("Rule set for '{}' expired after {:?} idle", source_id, config.expiration_interval);
            }
            return None;
        }

        *entry.accessed_at.write() = now;
        let rule_set = entry.rule_set.read().clone();
        if entry.needs_refresh(now, &config) {
            self.schedule_refresh(source_id, &entry);
        }
        Some(rule_set)
    }

    fn schedule_refresh(&self, source_id: &str, entry: &Arc<CacheEntry>) {
        if entry.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let loader = Arc::clone(&self.loader);
        let entry = Arc::clone(entry);
        let counters = Arc::clone(&self.counters);
        let source_id = source_id.to_string();

        self.runtime.spawn_blocking(move || {
            let _in_flight = RefreshFlag(&entry);
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                refresh_entry(loader.as_ref(), &entry, &source_id, &counters)
            }));
            // Errors are counted and logged inside refresh_entry.
            if attempt.is_err() {
                Counters::bump(&counters.refresh_failures);
                *entry.written_at.write() = Instant::now();
                error!("Refresh of '{}' panicked, keeping previous rules", source_id);
            }
        });
    }

    fn load_lock(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.load_locks.lock();
        locks.entry(source_id.to_string()).or_default().clone()
    }

    /// Drops the map's handle on `lock` once no other caller holds a clone.
    ///
    /// Clones are only taken under `load_locks`, so a count of two (map and
    /// `lock`) means nobody is queued behind it.
    fn release_load_lock(&self, source_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.load_locks.lock();
        let idle = locks
            .get(source_id)
            .is_some_and(|current| Arc::ptr_eq(current, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(source_id);
        }
    }
}

fn compile_source(loader: &dyn RuleLoader, source_id: &str) -> Result<RuleSet, ConfigError> {
    let source = loader.load(source_id)?;
    RuleSet::compile(source_id, &source)
}

fn refresh_entry(
    loader: &dyn RuleLoader,
    entry: &CacheEntry,
    source_id: &str,
    counters: &Counters,
) -> Result<(), ConfigError> {
    match compile_source(loader, source_id) {
        Ok(rule_set) => {
            Counters::bump(&counters.refreshes);
            debug!("Refreshed {} rules for '{}'", rule_set.len(), source_id);
            entry.replace(Arc::new(rule_set));
            Ok(())
        }
        Err(e) => {
            Counters::bump(&counters.refresh_failures);
            // Wait a full interval before the next attempt.
            *entry.written_at.write() = Instant::now();
            error!("Refresh of '{}' failed, keeping previous rules: {}", source_id, e);
            Err(e)
        }
    }
}

/// Clears an entry's in-flight refresh flag when dropped, even on unwind.
struct RefreshFlag<'a>(&'a CacheEntry);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for RuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache")
            .field("config", &self.config())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StaticTunables;
    use crate::rules::{FilterKind, RuleDefinition};
    use crate::units::TtlUnit;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> Arc<dyn RuleLoader> {
        Arc::new(move |_: &str| -> Result<RuleSource, ConfigError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(RuleSource::new(vec![RuleDefinition::new(FilterKind::TokenOr)
                .with_ttl(1, TtlUnit::Seconds)
                .with_pattern("A")]))
        })
    }

    fn quiet_config() -> CacheConfig {
        CacheConfig::default().with_refresh_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_millis(5));
        assert_eq!(config.expiration_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_cache_config_from_tunables() {
        let tunables = StaticTunables::new();
        tunables.set(REFRESH_INTERVAL_KEY, "250");
        tunables.set(EXPIRATION_INTERVAL_KEY, "not a number");
        let config = CacheConfig::from_tunables(&tunables);
        assert_eq!(config.refresh_interval, Duration::from_millis(250));
        assert_eq!(config.expiration_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_hit_after_miss() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = RuleCache::new(counting_loader(calls.clone()), quiet_config(), rt.handle().clone());

        let first = cache.get_or_load("a").unwrap();
        let second = cache.get_or_load("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let rt = runtime();
        let loader: Arc<dyn RuleLoader> = Arc::new(|id: &str| -> Result<RuleSource, ConfigError> {
            Err(ConfigError::Source {
                source_id: id.to_string(),
                message: "missing".to_string(),
            })
        });
        let cache = RuleCache::new(loader, quiet_config(), rt.handle().clone());
        assert!(cache.get_or_load("gone").is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[test]
    fn test_expire_after_access() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = quiet_config().with_expiration_interval(Duration::from_millis(20));
        let cache = RuleCache::new(counting_loader(calls.clone()), config, rt.handle().clone());

        cache.get_or_load("a").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        cache.get_or_load("a").unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_evict_expired_sweeps_idle_entries() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = quiet_config().with_expiration_interval(Duration::from_millis(10));
        let cache = RuleCache::new(counting_loader(calls), config, rt.handle().clone());
        cache.get_or_load("a").unwrap();
        cache.get_or_load("b").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.evict_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reconfigure_keeps_entries() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = RuleCache::new(counting_loader(calls), quiet_config(), rt.handle().clone());
        cache.get_or_load("a").unwrap();

        let new_config = quiet_config().with_expiration_interval(Duration::from_secs(10));
        assert!(cache.reconfigure(new_config));
        assert!(!cache.reconfigure(new_config));
        assert_eq!(cache.config(), new_config);
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_invalidate() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = RuleCache::new(counting_loader(calls), quiet_config(), rt.handle().clone());
        cache.get_or_load("a").unwrap();
        cache.get_or_load("b").unwrap();
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
    }
}
