//! Rule-driven age-off for sorted, timestamped key/value stores.
//!
//! Layers, leaves first:
//! - **trie**: token spec text → immutable `TokenTtlTrie` (one-pass scan)
//! - **rules**: definitions → compiled `Rule`s, bound per session
//! - **ruleset / cache**: immutable `RuleSet` snapshots behind a refreshing `RuleCache`
//! - **engine**: `AgeOffEngine`, the per-record accept/reject protocol
//!
//! ```rust
//! use std::sync::Arc;
//! use ageoff::{AgeOffEngine, FilterKind, Record, RuleDefinition, RuleSet, RuleSource, SessionConfig, TtlUnit};
//!
//! let source = RuleSource::new(vec![RuleDefinition::new(FilterKind::TokenOr)
//!     .with_ttl(30, TtlUnit::Seconds)
//!     .with_pattern("PUBLIC")]);
//! let rule_set = Arc::new(RuleSet::compile("inline", &source)?);
//!
//! let config = SessionConfig::new(1, TtlUnit::Days).with_anchor(100_000);
//! let mut engine = AgeOffEngine::from_rule_set(&config, rule_set)?;
//!
//! assert!(!engine.accept(&Record::new(60_000).with_visibility("PUBLIC")));
//! assert!(engine.accept(&Record::new(60_000).with_visibility("PRIVATE")));
//! # Ok::<(), ageoff::ConfigError>(())
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod period;
pub mod record;
pub mod rules;
pub mod ruleset;
pub mod trie;
pub mod types;
pub mod units;

pub use cache::{CacheConfig, CacheStats, RuleCache, RuleLoader, TunableSource, TunablesWatcher, WatcherConfig};
pub use engine::{describe_options, validate_options, AgeOffEngine, CompactionScope, Decision, SessionConfig};
pub use error::{ConfigError, OverflowError};
pub use period::AgeOffPeriod;
pub use record::{Field, Record, RecordView};
pub use rules::{BoundRule, FilterKind, Rule, RuleDefinition, RuleSource};
pub use ruleset::RuleSet;
pub use trie::{TokenSpecParser, TokenTtlTrie, TokenTtlTrieBuilder};
pub use units::TtlUnit;
