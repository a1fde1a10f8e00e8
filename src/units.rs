//! TTL units accepted in rule and session configuration.

use crate::error::{ConfigError, OverflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MS_PER_SECOND: u64 = 1000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Human TTL unit. Defaults to days, matching unit-less configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TtlUnit {
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[default]
    #[serde(rename = "d")]
    Days,
}

impl TtlUnit {
    pub const ALL: [TtlUnit; 5] = [
        TtlUnit::Milliseconds,
        TtlUnit::Seconds,
        TtlUnit::Minutes,
        TtlUnit::Hours,
        TtlUnit::Days,
    ];

    /// Milliseconds per unit.
    pub const fn factor(self) -> u64 {
        match self {
            TtlUnit::Milliseconds => 1,
            TtlUnit::Seconds => MS_PER_SECOND,
            TtlUnit::Minutes => MS_PER_MINUTE,
            TtlUnit::Hours => MS_PER_HOUR,
            TtlUnit::Days => MS_PER_DAY,
        }
    }

    /// The configuration keyword for this unit.
    pub const fn as_str(self) -> &'static str {
        match self {
            TtlUnit::Milliseconds => "ms",
            TtlUnit::Seconds => "s",
            TtlUnit::Minutes => "m",
            TtlUnit::Hours => "h",
            TtlUnit::Days => "d",
        }
    }

    /// Converts `value` units into milliseconds, rejecting negative values
    /// and products that do not fit in an `i64`.
    pub fn to_millis(self, value: i64) -> Result<i64, OverflowError> {
        let overflow = OverflowError { value, unit: self };
        if value < 0 {
            return Err(overflow);
        }
        // factor() is at most MS_PER_DAY, well inside i64
        value.checked_mul(self.factor() as i64).ok_or(overflow)
    }
}

impl FromStr for TtlUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TtlUnit::ALL
            .into_iter()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidUnit(s.to_string()))
    }
}

impl fmt::Display for TtlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_factors() {
        assert_eq!(TtlUnit::Milliseconds.factor(), 1);
        assert_eq!(TtlUnit::Seconds.factor(), 1_000);
        assert_eq!(TtlUnit::Minutes.factor(), 60_000);
        assert_eq!(TtlUnit::Hours.factor(), 3_600_000);
        assert_eq!(TtlUnit::Days.factor(), 86_400_000);
    }

    #[test]
    fn test_parse_keywords() {
        for unit in TtlUnit::ALL {
            assert_eq!(unit.as_str().parse::<TtlUnit>().unwrap(), unit);
        }
        assert_eq!(
            "w".parse::<TtlUnit>(),
            Err(ConfigError::InvalidUnit("w".to_string()))
        );
    }

    #[test]
    fn test_default_is_days() {
        assert_eq!(TtlUnit::default(), TtlUnit::Days);
    }

    #[test]
    fn test_to_millis_guards_overflow() {
        assert_eq!(TtlUnit::Seconds.to_millis(30), Ok(30_000));
        assert!(TtlUnit::Days.to_millis(i64::MAX / 1000).is_err());
        assert!(TtlUnit::Milliseconds.to_millis(-1).is_err());
    }

    #[test]
    fn test_serde_uses_keywords() {
        let json = serde_json::to_string(&TtlUnit::Minutes).unwrap();
        assert_eq!(json, "\"m\"");
        let unit: TtlUnit = serde_json::from_str("\"ms\"").unwrap();
        assert_eq!(unit, TtlUnit::Milliseconds);
    }
}
