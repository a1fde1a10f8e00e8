//! Immutable, compiled rule snapshot of one configuration source.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{ConfigError, OverflowError};
use crate::rules::{BoundRule, CompileContext, Rule, RuleSource};
use crate::types::now_ms;

/// Ordered compiled rules plus bookkeeping.
///
/// Never mutated after construction; a reload produces a new `RuleSet`.
/// Sessions hold an `Arc<RuleSet>` and keep a consistent view while the
/// cache swaps in newer snapshots.
#[derive(Debug, Clone)]
pub struct RuleSet {
    source_id: String,
    loaded_at: i64,
    rules: Vec<Arc<Rule>>,
    is_merge: bool,
}

impl RuleSet {
    /// Compiles every definition of `source` in order.
    ///
    /// Fails on the first invalid definition; a partially compiled set is
    /// never returned.
    pub fn compile(source_id: impl Into<String>, source: &RuleSource) -> Result<Self, ConfigError> {
        let source_id = source_id.into();
        let ctx = CompileContext::from_source(source)?;

        let rules = source
            .rules
            .iter()
            .map(|def| Rule::compile(def, &ctx).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Compiled {} rules from '{}' (merge={})",
            rules.len(),
            source_id,
            source.is_merge
        );

        Ok(Self {
            source_id,
            loaded_at: now_ms(),
            rules,
            is_merge: source.is_merge,
        })
    }

    /// A set with no rules; every record falls through to the default TTL.
    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            loaded_at: now_ms(),
            rules: Vec::new(),
            is_merge: false,
        }
    }

    /// Binds every rule to `anchor_millis`, preserving order.
    pub fn bind(&self, anchor_millis: i64) -> Result<Vec<BoundRule>, OverflowError> {
        self.rules.iter().map(|rule| rule.bind(anchor_millis)).collect()
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Milliseconds since the UNIX epoch at compile time.
    pub fn loaded_at(&self) -> i64 {
        self.loaded_at
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.is_merge
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "RuleSet '{}' ({} rules, loaded_at={}, merge={})",
            self.source_id,
            self.rules.len(),
            self.loaded_at,
            self.is_merge
        )?;
        for (idx, rule) in self.rules.iter().enumerate() {
            writeln!(f, "  [{}] {}", idx, rule)?;
        }
        Ok(())
    }
}
