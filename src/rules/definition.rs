//! Declarative rule definitions, as handed over by a configuration loader.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;
use crate::record::Field;
use crate::units::TtlUnit;

/// Which rule variant a definition compiles into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Never applies.
    PassThrough,
    /// Applies when every listed token is present in the field.
    TokenAnd,
    /// Applies when at least one listed token is present in the field.
    TokenOr,
    /// Per-token TTLs scanned out of a field with a [`TokenTtlTrie`](crate::trie::TokenTtlTrie).
    FieldTtl,
    /// Per-field-name TTLs.
    FieldName,
    /// Applies when a regex matches the field.
    Regex,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterKind::PassThrough => "pass_through",
            FilterKind::TokenAnd => "token_and",
            FilterKind::TokenOr => "token_or",
            FilterKind::FieldTtl => "field_ttl",
            FilterKind::FieldName => "field_name",
            FilterKind::Regex => "regex",
        };
        f.write_str(name)
    }
}

/// One rule as configured by an operator.
///
/// `match_pattern` is token spec text for token and field-ttl rules and a
/// regex for regex rules. Variant-specific settings go in `options`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub filter: FilterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_units: Option<TtlUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiters: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl RuleDefinition {
    pub fn new(filter: FilterKind) -> Self {
        Self {
            filter,
            label: None,
            ttl: None,
            ttl_units: None,
            match_pattern: None,
            field: None,
            delimiters: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_ttl(mut self, ttl: i64, units: TtlUnit) -> Self {
        self.ttl = Some(ttl);
        self.ttl_units = Some(units);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.match_pattern = Some(pattern.into());
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.field = Some(field);
        self
    }

    pub fn with_delimiters(mut self, delimiters: impl Into<String>) -> Self {
        self.delimiters = Some(delimiters.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

/// The ordered rule list of one configuration source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSource {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    /// Inherited by rules that configure no ttl of their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_units: Option<TtlUnit>,
    /// Re-registered tokens override earlier TTLs instead of failing.
    #[serde(default)]
    pub is_merge: bool,
}

impl RuleSource {
    pub fn new(rules: Vec<RuleDefinition>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: i64, units: TtlUnit) -> Self {
        self.default_ttl = Some(ttl);
        self.default_ttl_units = Some(units);
        self
    }

    pub fn with_merge(mut self, is_merge: bool) -> Self {
        self.is_merge = is_merge;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Source {
            source_id: "<json>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Source {
            source_id: "<json>".to_string(),
            message: e.to_string(),
        })
    }

    /// Combines `self` with an overlay source.
    ///
    /// An overlay rule whose label matches a base rule appends its pattern to
    /// the base rule's pattern, replaces its ttl when it sets one, and adds
    /// its options. Other overlay rules are appended in order. The result is
    /// a merge source, so later token TTLs override earlier ones.
    ///
    /// # Errors
    /// `InvalidOption` when a labelled overlay rule names a different filter
    /// kind than the base rule it extends.
    pub fn merge(mut self, overlay: RuleSource) -> Result<RuleSource, ConfigError> {
        for rule in overlay.rules {
            let target = rule.label.as_ref().and_then(|label| {
                self.rules
                    .iter_mut()
                    .find(|existing| existing.label.as_ref() == Some(label))
            });

            match target {
                Some(existing) => {
                    if existing.filter != rule.filter {
                        return Err(ConfigError::InvalidOption {
                            name: "filter".to_string(),
                            value: format!(
                                "{} for rule \"{}\" already defined as {}",
                                rule.filter,
                                rule.label.as_deref().unwrap_or_default(),
                                existing.filter
                            ),
                        });
                    }
                    existing.match_pattern = match (existing.match_pattern.take(), rule.match_pattern) {
                        (Some(base), Some(extra)) => Some(format!("{}\n{}", base, extra)),
                        (base, extra) => base.or(extra),
                    };
                    if rule.ttl.is_some() {
                        existing.ttl = rule.ttl;
                        existing.ttl_units = rule.ttl_units;
                    }
                    existing.options.extend(rule.options);
                }
                None => self.rules.push(rule),
            }
        }

        if overlay.default_ttl.is_some() {
            self.default_ttl = overlay.default_ttl;
            self.default_ttl_units = overlay.default_ttl_units;
        }
        self.is_merge = true;
        Ok(self)
    }
}
