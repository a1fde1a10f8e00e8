//! Per-session age-off evaluation.
//!
//! One [`AgeOffEngine`] per concurrent scan or compaction. It binds a shared
//! [`RuleSet`] snapshot to the session anchor and runs the cascading
//! protocol for every record:
//!
//! 1. **Disabled**: the session scope turned filtering off; keep
//! 2. **ShortCircuited**: newer than the short-circuit cutoff; keep
//! 3. **Rule**: the first rule whose pattern matched decides
//! 4. **Fallback**: `timestamp > default cutoff`
//!
//! Evaluation never fails and never allocates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, error, trace};

use crate::cache::RuleCache;
use crate::error::ConfigError;
use crate::period::AgeOffPeriod;
use crate::record::RecordView;
use crate::rules::BoundRule;
use crate::ruleset::RuleSet;
use crate::types::now_ms;
use crate::units::TtlUnit;

// ================================================================================================
// SESSION OPTIONS
// ================================================================================================

pub const TTL_OPTION: &str = "ttl";
pub const TTL_UNITS_OPTION: &str = "ttlUnits";
pub const TTL_SHORT_CIRCUIT_OPTION: &str = "ttlShortCircuit";
pub const FILTER_CONFIG_OPTION: &str = "filterConfig";
pub const DISABLE_ON_NON_FULL_MAJC_OPTION: &str = "disableOnNonFullMajc";
pub const ONLY_ON_USER_COMPACTION_OPTION: &str = "onlyOnUserCompaction";
pub const SCAN_START_TIMESTAMP_OPTION: &str = "scanStartTimestamp";

/// What kind of pass the host is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionScope {
    #[default]
    Scan,
    MinorCompaction,
    MajorCompaction {
        /// Compacting every file of the tablet
        full: bool,
        /// Requested by an operator rather than the system
        user: bool,
    },
}

/// Settings of one evaluation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Default TTL for records no rule applies to
    pub ttl: i64,
    /// Units of `ttl` and `short_circuit_ttl`
    pub ttl_units: TtlUnit,
    /// Records newer than `anchor - short_circuit_ttl` skip rule evaluation.
    /// `None` behaves as zero.
    pub short_circuit_ttl: Option<i64>,
    /// Rule source id; `None` means default TTL only
    pub filter_source: Option<String>,
    /// Session anchor in epoch milliseconds; `None` means now
    pub anchor_millis: Option<i64>,
    pub disable_on_non_full_majc: bool,
    pub only_on_user_compaction: bool,
    pub scope: CompactionScope,
}

impl SessionConfig {
    pub fn new(ttl: i64, ttl_units: TtlUnit) -> Self {
        Self {
            ttl,
            ttl_units,
            short_circuit_ttl: None,
            filter_source: None,
            anchor_millis: None,
            disable_on_non_full_majc: false,
            only_on_user_compaction: false,
            scope: CompactionScope::Scan,
        }
    }

    pub fn with_short_circuit(mut self, ttl: i64) -> Self {
        self.short_circuit_ttl = Some(ttl);
        self
    }

    pub fn with_filter_source(mut self, source_id: impl Into<String>) -> Self {
        self.filter_source = Some(source_id.into());
        self
    }

    pub fn with_anchor(mut self, anchor_millis: i64) -> Self {
        self.anchor_millis = Some(anchor_millis);
        self
    }

    pub fn with_scope(mut self, scope: CompactionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_disable_on_non_full_majc(mut self, disable: bool) -> Self {
        self.disable_on_non_full_majc = disable;
        self
    }

    pub fn with_only_on_user_compaction(mut self, only: bool) -> Self {
        self.only_on_user_compaction = only;
        self
    }

    /// Builds a session from host iterator options.
    ///
    /// # Errors
    /// - `MissingOption` when `ttl` or `ttlUnits` is absent
    /// - `InvalidTtl` / `InvalidUnit` for malformed values
    /// - `InvalidOption` for non-boolean flags or a bad scan start
    pub fn from_options(options: &HashMap<String, String>, scope: CompactionScope) -> Result<Self, ConfigError> {
        let raw_ttl = options
            .get(TTL_OPTION)
            .ok_or_else(|| ConfigError::MissingOption(TTL_OPTION.to_string()))?;
        let ttl = parse_ttl(raw_ttl)?;

        let ttl_units = options
            .get(TTL_UNITS_OPTION)
            .ok_or_else(|| ConfigError::MissingOption(TTL_UNITS_OPTION.to_string()))?
            .parse::<TtlUnit>()?;

        let short_circuit_ttl = options
            .get(TTL_SHORT_CIRCUIT_OPTION)
            .map(|raw| parse_ttl(raw))
            .transpose()?;

        let anchor_millis = match options.get(SCAN_START_TIMESTAMP_OPTION) {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| ConfigError::InvalidOption {
                name: SCAN_START_TIMESTAMP_OPTION.to_string(),
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            ttl,
            ttl_units,
            short_circuit_ttl,
            filter_source: options.get(FILTER_CONFIG_OPTION).cloned(),
            anchor_millis,
            disable_on_non_full_majc: parse_flag(options, DISABLE_ON_NON_FULL_MAJC_OPTION)?,
            only_on_user_compaction: parse_flag(options, ONLY_ON_USER_COMPACTION_OPTION)?,
            scope,
        })
    }

    /// True when filtering is switched off for this session's scope.
    pub fn is_disabled(&self) -> bool {
        match self.scope {
            CompactionScope::MajorCompaction { full, user } => {
                (self.disable_on_non_full_majc && !full) || (self.only_on_user_compaction && !user)
            }
            CompactionScope::Scan | CompactionScope::MinorCompaction => false,
        }
    }
}

fn parse_ttl(raw: &str) -> Result<i64, ConfigError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::InvalidTtl(raw.to_string()))
}

/// Absent is `false`; anything but exactly `true` / `false` is an error.
fn parse_flag(options: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match options.get(name).map(String::as_str) {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(ConfigError::InvalidOption {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Checks host options without building a session. Logs the first problem.
pub fn validate_options(options: &HashMap<String, String>) -> bool {
    match SessionConfig::from_options(options, CompactionScope::Scan) {
        Ok(_) => true,
        Err(e) => {
            error!("Invalid age-off options: {}", e);
            false
        }
    }
}

/// Option names with operator help text.
pub fn describe_options() -> BTreeMap<&'static str, &'static str> {
    let mut options = BTreeMap::new();
    options.insert(TTL_OPTION, "Default time to live.");
    options.insert(
        TTL_UNITS_OPTION,
        "Default time to live units. (d, h, m, s, or ms [default = d])",
    );
    options.insert(
        TTL_SHORT_CIRCUIT_OPTION,
        "Interval after which no data is aged off allowing this filter to bypass calling the rules",
    );
    options.insert(FILTER_CONFIG_OPTION, "Identifier of the age-off rule source.");
    options.insert(
        DISABLE_ON_NON_FULL_MAJC_OPTION,
        "If 'true', rules are disabled for non-full major compactions. Deprecated, use onlyOnUserCompaction.",
    );
    options.insert(
        ONLY_ON_USER_COMPACTION_OPTION,
        "If 'true', rules only run for user-initiated major compactions. [default = false]",
    );
    options.insert(
        SCAN_START_TIMESTAMP_OPTION,
        "Anchor time in epoch milliseconds. [default = now]",
    );
    options
}

// ================================================================================================
// ENGINE
// ================================================================================================

/// Which protocol step produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Disabled,
    ShortCircuited,
    /// Rule at `index` (configured order) applied
    Rule { index: usize, accept: bool },
    /// No rule applied
    Fallback { accept: bool },
}

impl Decision {
    #[inline]
    pub fn accepted(&self) -> bool {
        match *self {
            Decision::Disabled | Decision::ShortCircuited => true,
            Decision::Rule { accept, .. } | Decision::Fallback { accept } => accept,
        }
    }
}

/// Age-off state of one evaluation session.
///
/// Not shared between threads; clone it instead. Clones share the compiled
/// rules and copy only the per-rule bindings.
#[derive(Debug, Clone)]
pub struct AgeOffEngine {
    rule_set: Arc<RuleSet>,
    bound_rules: Vec<BoundRule>,
    default_period: AgeOffPeriod,
    short_circuit_cutoff_millis: i64,
    disabled: bool,
}

impl AgeOffEngine {
    /// Starts a session, fetching its rules from `cache`.
    ///
    /// A rule source that fails to load or bind is logged and the session
    /// runs on the default TTL alone.
    ///
    /// # Arguments
    /// - `config`: session TTLs, anchor, rule source id and compaction scope
    /// - `cache`: shared rule cache; the session keeps the snapshot it gets
    ///
    /// # Returns
    /// An engine bound at the session anchor. Later reloads of the rule
    /// source do not affect it.
    ///
    /// # Errors
    /// `Overflow` when the session TTLs do not fit the anchor.
    ///
    /// # Example
    /// ```rust,no_run
    /// use ageoff::{AgeOffEngine, Record, RuleCache, SessionConfig, TtlUnit};
    /// # fn scan(cache: &RuleCache, records: &[Record]) -> Result<(), ageoff::ConfigError> {
    ///
    /// let config = SessionConfig::new(30, TtlUnit::Days).with_filter_source("rules.json");
    /// let mut engine = AgeOffEngine::new(&config, cache)?;
    /// let kept = records.iter().filter(|r| engine.accept(*r)).count();
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: &SessionConfig, cache: &RuleCache) -> Result<Self, ConfigError> {
        let rule_set = match config.filter_source.as_deref() {
            Some(source_id) => match cache.get_or_load(source_id) {
                Ok(rule_set) => rule_set,
                Err(e) => {
                    error!(
                        "Rules from '{}' unavailable, using default ttl only: {}",
                        source_id, e
                    );
                    Arc::new(RuleSet::empty(source_id))
                }
            },
            None => {
                debug!("No rule source configured, using default ttl only");
                Arc::new(RuleSet::empty(""))
            }
        };
        Self::from_rule_set(config, rule_set)
    }

    /// Starts a session on an already obtained snapshot.
    pub fn from_rule_set(config: &SessionConfig, rule_set: Arc<RuleSet>) -> Result<Self, ConfigError> {
        let anchor_millis = config.anchor_millis.unwrap_or_else(now_ms);
        let default_period = AgeOffPeriod::new(anchor_millis, config.ttl, config.ttl_units)?;
        let short_circuit_cutoff_millis = AgeOffPeriod::short_circuit(
            anchor_millis,
            config.short_circuit_ttl.unwrap_or(0),
            config.ttl_units,
        )?;

        let (rule_set, bound_rules) = match rule_set.bind(anchor_millis) {
            Ok(bound) => (rule_set, bound),
            Err(e) => {
                error!(
                    "Rules from '{}' cannot be bound at {}, using default ttl only: {}",
                    rule_set.source_id(),
                    anchor_millis,
                    e
                );
                let empty = Arc::new(RuleSet::empty(rule_set.source_id()));
                (empty, Vec::new())
            }
        };

        let disabled = config.is_disabled();
        debug!(
            "Age-off session for '{}': {} rules, disabled={}",
            rule_set.source_id(),
            bound_rules.len(),
            disabled
        );
        trace!(
            "anchor={} default_cutoff={} short_circuit_cutoff={}",
            anchor_millis,
            default_period.cutoff_millis(),
            short_circuit_cutoff_millis
        );

        Ok(Self {
            rule_set,
            bound_rules,
            default_period,
            short_circuit_cutoff_millis,
            disabled,
        })
    }

    /// Runs the cascading protocol for one record.
    #[inline]
    pub fn decide<R: RecordView + ?Sized>(&mut self, record: &R) -> Decision {
        if self.disabled {
            return Decision::Disabled;
        }

        let timestamp = record.age_off_timestamp();
        if timestamp > self.short_circuit_cutoff_millis {
            return Decision::ShortCircuited;
        }

        for (index, rule) in self.bound_rules.iter_mut().enumerate() {
            let accept = rule.accept(record);
            if rule.applied() {
                return Decision::Rule { index, accept };
            }
        }

        Decision::Fallback {
            accept: self.default_period.is_live(timestamp),
        }
    }

    /// True to keep the record.
    #[inline]
    pub fn accept<R: RecordView + ?Sized>(&mut self, record: &R) -> bool {
        self.decide(record).accepted()
    }

    pub fn rule_set(&self) -> &Arc<RuleSet> {
        &self.rule_set
    }

    pub fn bound_rules(&self) -> &[BoundRule] {
        &self.bound_rules
    }

    pub fn anchor_millis(&self) -> i64 {
        self.default_period.anchor_millis()
    }

    pub fn default_cutoff_millis(&self) -> i64 {
        self.default_period.cutoff_millis()
    }

    pub fn short_circuit_cutoff_millis(&self) -> i64 {
        self.short_circuit_cutoff_millis
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl fmt::Display for AgeOffEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AgeOffEngine[default cutoff={}, short_circuit={}, disabled={}, source='{}', rules=[",
            self.default_period.cutoff_millis(),
            self.short_circuit_cutoff_millis,
            self.disabled,
            self.rule_set.source_id()
        )?;
        for (idx, rule) in self.bound_rules.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", rule)?;
        }
        f.write_str("]]")
    }
}
