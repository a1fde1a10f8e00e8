//! Compiled rule cache and its tunable intervals.
//!
//! Two pieces:
//! 1. **RuleCache**: source id → `Arc<RuleSet>`, refresh-after-write and
//!    expire-after-access, single-flight cold loads
//! 2. **TunablesWatcher**: background task re-reading the cache intervals
//!    from host configuration (10-second default)

pub mod rule_cache;
pub mod tunables;

pub use rule_cache::{CacheConfig, CacheStats, RuleCache, RuleLoader};
pub use tunables::{
    StaticTunables, TunableSource, TunablesWatcher, WatcherConfig, EXPIRATION_INTERVAL_KEY,
    REFRESH_INTERVAL_KEY,
};
