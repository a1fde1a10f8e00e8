//! Error types raised while compiling age-off configuration.
//!
//! Every error here surfaces at load time. Per-record evaluation has no
//! failure mode and never returns one of these.

use crate::units::TtlUnit;
use thiserror::Error;

/// A TTL whose millisecond value does not fit in an `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ttl {value}{unit} overflows the representable millisecond range")]
pub struct OverflowError {
    pub value: i64,
    pub unit: TtlUnit,
}

/// Malformed or inconsistent age-off configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid token spec at offset {offset}: {message} (near \"{excerpt}\")")]
    InvalidSpec {
        message: String,
        offset: usize,
        excerpt: String,
    },

    #[error("duplicate token \"{token}\"")]
    DuplicateToken { token: String },

    #[error("delimiter {delimiter:?} also appears in token \"{token}\"")]
    DelimiterCollision { delimiter: char, token: String },

    #[error("tokens must not be empty")]
    EmptyToken,

    #[error("invalid ttl unit \"{0}\"")]
    InvalidUnit(String),

    #[error("invalid ttl value \"{0}\"")]
    InvalidTtl(String),

    #[error("no ttl configured for {context}")]
    MissingTtl { context: String },

    #[error("invalid regex \"{pattern}\": {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid value for option {name}: \"{value}\"")]
    InvalidOption { name: String, value: String },

    #[error("required option {0} is not set")]
    MissingOption(String),

    #[error("failed to load rule source {source_id}: {message}")]
    Source { source_id: String, message: String },

    #[error(transparent)]
    Overflow(#[from] OverflowError),
}

impl ConfigError {
    /// Builds an `InvalidSpec` error carrying up to 20 characters of the
    /// input starting at `offset`.
    pub fn invalid_spec(message: impl Into<String>, input: &str, offset: usize) -> Self {
        let excerpt = input
            .get(offset..)
            .unwrap_or_default()
            .chars()
            .take(20)
            .collect();
        ConfigError::InvalidSpec {
            message: message.into(),
            offset,
            excerpt,
        }
    }
}
