//! Integration tests for the rule cache and tunables watcher.
//!
//! Tests verify:
//! - Single-flight cold loads under concurrent misses, including failed loads
//! - Background refresh swaps snapshots without blocking readers
//! - Failed or panicking refreshes keep the previous snapshot and retry
//! - Sessions keep the snapshot they started with
//! - Interval changes picked up from tunables

use ageoff::cache::{StaticTunables, EXPIRATION_INTERVAL_KEY, REFRESH_INTERVAL_KEY};
use ageoff::{
    AgeOffEngine, CacheConfig, ConfigError, FilterKind, Record, RuleCache, RuleDefinition, RuleLoader, RuleSource,
    SessionConfig, TtlUnit, TunablesWatcher, WatcherConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Loader whose rule content is selected by a shared version number.
///
/// Version N yields a single token rule for token `V<N>` with a 1 s ttl.
struct VersionedLoader {
    version: AtomicUsize,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl VersionedLoader {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            version: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay,
        })
    }
}

impl RuleLoader for VersionedLoader {
    fn load(&self, source_id: &str) -> Result<RuleSource, ConfigError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConfigError::Source {
                source_id: source_id.to_string(),
                message: "unreachable".to_string(),
            });
        }
        let version = self.version.load(Ordering::SeqCst);
        Ok(RuleSource::new(vec![RuleDefinition::new(FilterKind::TokenOr)
            .with_label("versioned")
            .with_ttl(1, TtlUnit::Seconds)
            .with_pattern(format!("V{}", version))]))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn quiet() -> CacheConfig {
    CacheConfig::default().with_refresh_interval(Duration::from_secs(3600))
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

// ============================================================================
// LOADING
// ============================================================================

#[test]
fn test_concurrent_misses_load_once() {
    let rt = runtime();
    let loader = VersionedLoader::new(Duration::from_millis(50));
    let cache = Arc::new(RuleCache::new(loader.clone(), quiet(), rt.handle().clone()));
    let mut handles = vec![];

    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || cache.get_or_load("rules").unwrap()));
    }

    let snapshots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));

    let stats = cache.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}

/// Loader that sleeps, fails, and records how many loads overlap.
struct SlowFailingLoader {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RuleLoader for SlowFailingLoader {
    fn load(&self, source_id: &str) -> Result<RuleSource, ConfigError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Err(ConfigError::Source {
            source_id: source_id.to_string(),
            message: "timed out".to_string(),
        })
    }
}

#[test]
fn test_failed_loads_never_overlap() {
    let rt = runtime();
    let loader = Arc::new(SlowFailingLoader {
        calls: AtomicUsize::new(0),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let cache = Arc::new(RuleCache::new(loader.clone(), quiet(), rt.handle().clone()));
    let mut handles = vec![];

    for i in 0..16u64 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            // arrive while earlier loads are queued or finishing
            thread::sleep(Duration::from_millis(i * 15));
            cache.get_or_load("k").is_err()
        }));
    }

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(loader.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(loader.calls.load(Ordering::SeqCst) >= 1);
    assert!(cache.is_empty());
}

#[test]
fn test_distinct_keys_load_independently() {
    let rt = runtime();
    let loader = VersionedLoader::new(Duration::ZERO);
    let cache = RuleCache::new(loader.clone(), quiet(), rt.handle().clone());
    let a = cache.get_or_load("a").unwrap();
    let b = cache.get_or_load("b").unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.source_id(), "a");
    assert_eq!(cache.len(), 2);
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// REFRESH
// ============================================================================

#[test]
fn test_background_refresh_swaps_snapshot() {
    let rt = runtime();
    let loader = VersionedLoader::new(Duration::ZERO);
    let config = CacheConfig::default().with_refresh_interval(Duration::from_millis(10));
    let cache = RuleCache::new(loader.clone(), config, rt.handle().clone());

    let first = cache.get_or_load("rules").unwrap();
    assert!(first.to_string().contains("\"V1\""));

    loader.version.store(2, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));

    // this read schedules the refresh and still sees the old snapshot
    let stale = cache.get_or_load("rules").unwrap();
    assert!(Arc::ptr_eq(&first, &stale));

    let refreshed = wait_until(Duration::from_secs(2), || {
        cache
            .get_or_load("rules")
            .map(|s| s.to_string().contains("\"V2\""))
            .unwrap_or(false)
    });
    assert!(refreshed, "refresh never landed");
    assert!(cache.stats().refreshes >= 1);
    // the old snapshot is unchanged
    assert!(first.to_string().contains("\"V1\""));
}

#[test]
fn test_failed_refresh_keeps_previous_snapshot() {
    let rt = runtime();
    let loader = VersionedLoader::new(Duration::ZERO);
    let cache = RuleCache::new(loader.clone(), quiet(), rt.handle().clone());
    let before = cache.get_or_load("rules").unwrap();

    loader.failing.store(true, Ordering::SeqCst);
    assert!(matches!(cache.refresh("rules"), Err(ConfigError::Source { .. })));

    let after = cache.get_or_load("rules").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(cache.stats().refresh_failures, 1);

    assert!(!cache.refresh("unknown").unwrap());
}

#[test]
fn test_refresh_resumes_after_loader_panic() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let loader: Arc<dyn RuleLoader> = Arc::new(move |_: &str| -> Result<RuleSource, ConfigError> {
        // second call is the first background refresh
        if counted.fetch_add(1, Ordering::SeqCst) == 1 {
            panic!("loader crashed");
        }
        Ok(RuleSource::new(vec![RuleDefinition::new(FilterKind::TokenOr)
            .with_ttl(1, TtlUnit::Seconds)
            .with_pattern("A")]))
    });
    let config = CacheConfig::default().with_refresh_interval(Duration::from_millis(5));
    let cache = RuleCache::new(loader, config, rt.handle().clone());
    let first = cache.get_or_load("rules").unwrap();

    let refreshed = wait_until(Duration::from_secs(2), || {
        let current = cache.get_or_load("rules").unwrap();
        assert_eq!(current.len(), first.len());
        cache.stats().refreshes >= 1
    });
    assert!(refreshed, "refresh stopped after the panic");
    assert!(calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(cache.stats().refresh_failures, 1);
}

#[test]
fn test_session_keeps_its_snapshot_across_reload() {
    let rt = runtime();
    let loader = VersionedLoader::new(Duration::ZERO);
    let cache = RuleCache::new(loader.clone(), quiet(), rt.handle().clone());

    let config = SessionConfig::new(1, TtlUnit::Days)
        .with_anchor(100_000)
        .with_filter_source("rules");
    let mut session = AgeOffEngine::new(&config, &cache).unwrap();

    loader.version.store(2, Ordering::SeqCst);
    assert!(cache.refresh("rules").unwrap());

    let v1 = Record::new(50_000).with_visibility("V1");
    let v2 = Record::new(50_000).with_visibility("V2");

    // old session still evaluates V1 rules
    assert!(!session.accept(&v1));
    assert!(session.accept(&v2));

    // a new session sees V2 rules
    let mut fresh = AgeOffEngine::new(&config, &cache).unwrap();
    assert!(fresh.accept(&v1));
    assert!(!fresh.accept(&v2));
}

// ============================================================================
// TUNABLES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_applies_new_intervals() {
    let loader = VersionedLoader::new(Duration::ZERO);
    let cache = Arc::new(RuleCache::new(
        loader,
        CacheConfig::default(),
        tokio::runtime::Handle::current(),
    ));
    let tunables = Arc::new(StaticTunables::new());
    let watcher = Arc::new(TunablesWatcher::new(
        cache.clone(),
        tunables.clone(),
        WatcherConfig {
            check_interval: Duration::from_millis(10),
            enabled: true,
        },
    ));
    let task = tokio::spawn(watcher.clone().start());

    tunables.set(REFRESH_INTERVAL_KEY, "250");
    tunables.set(EXPIRATION_INTERVAL_KEY, "60000");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        cache.config(),
        CacheConfig {
            refresh_interval: Duration::from_millis(250),
            expiration_interval: Duration::from_secs(60),
        }
    );
    assert!(watcher.last_check() > 0);
    task.abort();
}

#[tokio::test]
async fn test_disabled_watcher_returns() {
    let loader = VersionedLoader::new(Duration::ZERO);
    let cache = Arc::new(RuleCache::new(loader, quiet(), tokio::runtime::Handle::current()));
    let watcher = Arc::new(TunablesWatcher::new(
        cache,
        Arc::new(StaticTunables::new()),
        WatcherConfig {
            check_interval: Duration::from_millis(10),
            enabled: false,
        },
    ));
    // completes instead of looping forever
    watcher.start().await;
}
