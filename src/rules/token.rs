//! Token-set rules (AND / OR over delimiter-bounded tokens).

use std::fmt;

use super::definition::RuleDefinition;
use super::{CompileContext, RuleVerdict};
use crate::error::ConfigError;
use crate::period::AgeOffPeriod;
use crate::record::{Field, RecordView};
use crate::trie::{parse_entries, DEFAULT_DELIMITERS};

/// How the configured tokens combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    /// Every token must be present.
    All,
    /// At least one token must be present.
    Any,
}

/// Applies when the field contains all (or any) of its tokens as whole
/// delimiter-bounded segments.
#[derive(Debug, Clone)]
pub struct TokenRule {
    mode: TokenMode,
    /// `None` when no pattern was configured; such a rule never applies.
    tokens: Option<Vec<Vec<u8>>>,
    field: Field,
    delimiters: Vec<u8>,
    ttl_millis: i64,
}

impl TokenRule {
    pub fn compile(def: &RuleDefinition, ctx: &CompileContext, mode: TokenMode) -> Result<Self, ConfigError> {
        let ttl_millis = ctx.require_ttl_millis(def)?;
        let delimiters = def
            .delimiters
            .as_ref()
            .map(|d| d.as_bytes().to_vec())
            .unwrap_or_else(|| DEFAULT_DELIMITERS.to_vec());

        let tokens = match def.match_pattern.as_deref() {
            Some(pattern) => {
                let entries = parse_entries(pattern)?;
                let mut tokens = Vec::with_capacity(entries.len());
                for entry in entries {
                    if entry.ttl_millis.is_some() {
                        return Err(ConfigError::InvalidOption {
                            name: "match_pattern".to_string(),
                            value: pattern.to_string(),
                        });
                    }
                    if let Some(&d) = entry.token.iter().find(|b| delimiters.contains(b)) {
                        return Err(ConfigError::DelimiterCollision {
                            delimiter: d as char,
                            token: String::from_utf8_lossy(&entry.token).into_owned(),
                        });
                    }
                    tokens.push(entry.token);
                }
                Some(tokens).filter(|t| !t.is_empty())
            }
            None => None,
        };

        Ok(Self {
            mode,
            tokens,
            field: def.field.unwrap_or(Field::ColumnVisibility),
            delimiters,
            ttl_millis,
        })
    }

    pub fn mode(&self) -> TokenMode {
        self.mode
    }

    pub fn ttl_millis(&self) -> i64 {
        self.ttl_millis
    }

    pub fn field(&self) -> Field {
        self.field
    }

    /// True when the pattern matches `input`. Returns false when no
    /// pattern is configured.
    pub fn matches(&self, input: &[u8]) -> bool {
        let Some(tokens) = self.tokens.as_ref() else {
            return false;
        };
        match self.mode {
            TokenMode::All => tokens.iter().all(|t| self.contains_token(input, t)),
            TokenMode::Any => tokens.iter().any(|t| self.contains_token(input, t)),
        }
    }

    #[inline]
    fn contains_token(&self, input: &[u8], token: &[u8]) -> bool {
        input
            .split(|b| self.delimiters.contains(b))
            .any(|segment| segment == token)
    }

    #[inline]
    pub fn evaluate<R: RecordView + ?Sized>(&self, period: &AgeOffPeriod, record: &R) -> RuleVerdict {
        if self.matches(record.field(self.field)) {
            RuleVerdict::applied(period.is_live(record.age_off_timestamp()))
        } else {
            RuleVerdict::NOT_APPLIED
        }
    }
}

impl fmt::Display for TokenRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.mode {
            TokenMode::All => "TokenAnd",
            TokenMode::Any => "TokenOr",
        };
        write!(f, "{}[field={}, ttl={}ms, tokens=", name, self.field, self.ttl_millis)?;
        match &self.tokens {
            Some(tokens) => {
                let rendered: Vec<String> = tokens
                    .iter()
                    .map(|t| format!("{:?}", String::from_utf8_lossy(t)))
                    .collect();
                write!(f, "{{{}}}]", rendered.join(", "))
            }
            None => f.write_str("none]"),
        }
    }
}
