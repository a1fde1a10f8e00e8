//! Age-off rules.
//!
//! A [`Rule`] is the immutable, compiled form of a [`RuleDefinition`]; it is
//! shared between sessions behind an `Arc`. A [`BoundRule`] pairs a rule with
//! one session's [`AgeOffPeriod`] and the "applied on the last call" flag.
//!
//! Contract for every variant: when the rule's pattern does not match the
//! record, it reports `applied = false` and keeps the record. A missing
//! match is never a reason to expire data.

pub mod definition;
pub mod field;
pub mod pattern;
pub mod token;

use std::fmt;
use std::sync::Arc;

pub use definition::{FilterKind, RuleDefinition, RuleSource};
pub use field::{FieldNameRule, FieldTtlRule};
pub use pattern::RegexRule;
pub use token::{TokenMode, TokenRule};

use crate::error::{ConfigError, OverflowError};
use crate::period::AgeOffPeriod;
use crate::record::RecordView;
use crate::units::TtlUnit;

/// Outcome of evaluating one rule against one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleVerdict {
    pub accept: bool,
    pub applied: bool,
}

impl RuleVerdict {
    /// The rule's pattern did not match; keep the record.
    pub const NOT_APPLIED: RuleVerdict = RuleVerdict {
        accept: true,
        applied: false,
    };

    #[inline]
    pub fn applied(accept: bool) -> Self {
        RuleVerdict {
            accept,
            applied: true,
        }
    }
}

/// Settings inherited from the enclosing rule source.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileContext {
    pub default_ttl_millis: Option<i64>,
    pub default_units: TtlUnit,
    pub merge: bool,
}

impl CompileContext {
    pub fn from_source(source: &RuleSource) -> Result<Self, ConfigError> {
        let default_units = source.default_ttl_units.unwrap_or_default();
        let default_ttl_millis = match source.default_ttl {
            Some(ttl) => Some(default_units.to_millis(ttl)?),
            None => None,
        };
        Ok(Self {
            default_ttl_millis,
            default_units,
            merge: source.is_merge,
        })
    }

    /// Units that apply to numbers in `def`.
    pub fn units_for(&self, def: &RuleDefinition) -> TtlUnit {
        def.ttl_units.unwrap_or(self.default_units)
    }

    /// The rule's own ttl, else the source default.
    pub fn ttl_millis(&self, def: &RuleDefinition) -> Result<Option<i64>, ConfigError> {
        match def.ttl {
            Some(ttl) => Ok(Some(self.units_for(def).to_millis(ttl)?)),
            None => Ok(self.default_ttl_millis),
        }
    }

    pub fn require_ttl_millis(&self, def: &RuleDefinition) -> Result<i64, ConfigError> {
        self.ttl_millis(def)?.ok_or_else(|| ConfigError::MissingTtl {
            context: format!("{} rule{}", def.filter, label_suffix(def)),
        })
    }
}

fn label_suffix(def: &RuleDefinition) -> String {
    def.label
        .as_ref()
        .map(|label| format!(" \"{}\"", label))
        .unwrap_or_default()
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub enum Rule {
    PassThrough,
    Token(TokenRule),
    FieldTtl(FieldTtlRule),
    FieldName(FieldNameRule),
    Regex(RegexRule),
}

impl Rule {
    pub fn compile(def: &RuleDefinition, ctx: &CompileContext) -> Result<Rule, ConfigError> {
        let rule = match def.filter {
            FilterKind::PassThrough => Rule::PassThrough,
            FilterKind::TokenAnd => Rule::Token(TokenRule::compile(def, ctx, TokenMode::All)?),
            FilterKind::TokenOr => Rule::Token(TokenRule::compile(def, ctx, TokenMode::Any)?),
            FilterKind::FieldTtl => Rule::FieldTtl(FieldTtlRule::compile(def, ctx)?),
            FilterKind::FieldName => Rule::FieldName(FieldNameRule::compile(def, ctx)?),
            FilterKind::Regex => Rule::Regex(RegexRule::compile(def, ctx)?),
        };
        Ok(rule)
    }

    /// Rule-wide TTL, if the variant has one.
    pub fn ttl_millis(&self) -> Option<i64> {
        match self {
            Rule::PassThrough => None,
            Rule::Token(rule) => Some(rule.ttl_millis()),
            Rule::FieldTtl(rule) => rule.default_ttl_millis(),
            Rule::FieldName(rule) => rule.default_ttl_millis(),
            Rule::Regex(rule) => Some(rule.ttl_millis()),
        }
    }

    #[inline]
    pub fn evaluate<R: RecordView + ?Sized>(&self, period: &AgeOffPeriod, record: &R) -> RuleVerdict {
        match self {
            Rule::PassThrough => RuleVerdict::NOT_APPLIED,
            Rule::Token(rule) => rule.evaluate(period, record),
            Rule::FieldTtl(rule) => rule.evaluate(period, record),
            Rule::FieldName(rule) => rule.evaluate(period, record),
            Rule::Regex(rule) => rule.evaluate(period, record),
        }
    }

    /// Binds the rule to a session anchor.
    pub fn bind(self: &Arc<Self>, anchor_millis: i64) -> Result<BoundRule, OverflowError> {
        let period = match self.ttl_millis() {
            Some(ttl) => AgeOffPeriod::new(anchor_millis, ttl, TtlUnit::Milliseconds)?,
            None => AgeOffPeriod::at(anchor_millis),
        };
        Ok(BoundRule {
            rule: Arc::clone(self),
            period,
            applied: false,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::PassThrough => f.write_str("PassThrough"),
            Rule::Token(rule) => fmt::Display::fmt(rule, f),
            Rule::FieldTtl(rule) => fmt::Display::fmt(rule, f),
            Rule::FieldName(rule) => fmt::Display::fmt(rule, f),
            Rule::Regex(rule) => fmt::Display::fmt(rule, f),
        }
    }
}

/// A shared rule bound to one session.
///
/// Cloning is cheap: the compiled rule is reference counted and only the
/// period and flag are copied.
#[derive(Debug, Clone)]
pub struct BoundRule {
    rule: Arc<Rule>,
    period: AgeOffPeriod,
    applied: bool,
}

impl BoundRule {
    /// Evaluates the record; [`applied`](Self::applied) reflects this call.
    #[inline]
    pub fn accept<R: RecordView + ?Sized>(&mut self, record: &R) -> bool {
        let verdict = self.rule.evaluate(&self.period, record);
        self.applied = verdict.applied;
        verdict.accept
    }

    /// Whether the rule's pattern matched on the last `accept` call.
    #[inline]
    pub fn applied(&self) -> bool {
        self.applied
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn period(&self) -> &AgeOffPeriod {
        &self.period
    }
}

impl fmt::Display for BoundRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cutoff={}", self.rule, self.period.cutoff_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn test_pass_through_never_applies() {
        let def = RuleDefinition::new(FilterKind::PassThrough);
        let rule = Arc::new(Rule::compile(&def, &CompileContext::default()).unwrap());
        let mut bound = rule.bind(1_000).unwrap();
        assert!(bound.accept(&Record::new(0)));
        assert!(!bound.applied());
    }

    #[test]
    fn test_source_default_ttl_inherited() {
        let source = RuleSource::new(vec![]).with_default_ttl(10, TtlUnit::Seconds);
        let ctx = CompileContext::from_source(&source).unwrap();
        let def = RuleDefinition::new(FilterKind::TokenOr).with_pattern("A");
        let rule = Rule::compile(&def, &ctx).unwrap();
        assert_eq!(rule.ttl_millis(), Some(10_000));
    }

    #[test]
    fn test_missing_ttl_is_error() {
        let def = RuleDefinition::new(FilterKind::Regex)
            .with_label("edges")
            .with_pattern("^edge");
        let err = Rule::compile(&def, &CompileContext::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingTtl {
                context: "regex rule \"edges\"".to_string()
            }
        );
    }

    #[test]
    fn test_bound_rule_tracks_applied_per_call() {
        let def = RuleDefinition::new(FilterKind::TokenOr)
            .with_ttl(1, TtlUnit::Seconds)
            .with_pattern("A");
        let rule = Arc::new(Rule::compile(&def, &CompileContext::default()).unwrap());
        let mut bound = rule.bind(10_000).unwrap();
        assert_eq!(bound.period().cutoff_millis(), 9_000);

        let matching = Record::new(8_000).with_visibility("A&B");
        assert!(!bound.accept(&matching));
        assert!(bound.applied());

        let other = Record::new(8_000).with_visibility("C");
        assert!(bound.accept(&other));
        assert!(!bound.applied());

        // the clone shares the compiled rule
        let copy = bound.clone();
        assert!(matches!(copy.rule(), Rule::Token(_)));
    }

    #[test]
    fn test_bind_rejects_underflowing_anchor() {
        let def = RuleDefinition::new(FilterKind::Regex)
            .with_ttl(1, TtlUnit::Days)
            .with_pattern(".");
        let rule = Arc::new(Rule::compile(&def, &CompileContext::default()).unwrap());
        assert!(rule.bind(i64::MIN).is_err());
    }
}
