//! Regex rule.

use regex::bytes::Regex;
use std::fmt;

use super::definition::RuleDefinition;
use super::{CompileContext, RuleVerdict};
use crate::error::ConfigError;
use crate::period::AgeOffPeriod;
use crate::record::{Field, RecordView};

/// Applies when the regex finds a match anywhere in the field.
#[derive(Debug, Clone)]
pub struct RegexRule {
    regex: Option<Regex>,
    field: Field,
    ttl_millis: i64,
}

impl RegexRule {
    pub fn compile(def: &RuleDefinition, ctx: &CompileContext) -> Result<Self, ConfigError> {
        let ttl_millis = ctx.require_ttl_millis(def)?;
        let regex = match def.match_pattern.as_deref() {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            regex,
            field: def.field.unwrap_or(Field::ColumnQualifier),
            ttl_millis,
        })
    }

    pub fn ttl_millis(&self) -> i64 {
        self.ttl_millis
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn pattern(&self) -> Option<&str> {
        self.regex.as_ref().map(Regex::as_str)
    }

    #[inline]
    pub fn evaluate<R: RecordView + ?Sized>(&self, period: &AgeOffPeriod, record: &R) -> RuleVerdict {
        match &self.regex {
            Some(regex) if regex.is_match(record.field(self.field)) => {
                RuleVerdict::applied(period.is_live(record.age_off_timestamp()))
            }
            _ => RuleVerdict::NOT_APPLIED,
        }
    }
}

impl fmt::Display for RegexRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Regex[field={}, ttl={}ms, pattern={:?}]",
            self.field,
            self.ttl_millis,
            self.pattern().unwrap_or("")
        )
    }
}
