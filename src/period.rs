//! Cutoff computation for one evaluation session.

use crate::error::OverflowError;
use crate::units::TtlUnit;
use std::fmt;

/// An anchor instant and the cutoff derived from it.
///
/// Records whose age-off timestamp is strictly greater than `cutoff_millis`
/// are live. `cutoff_millis <= anchor_millis` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeOffPeriod {
    anchor_millis: i64,
    cutoff_millis: i64,
}

impl AgeOffPeriod {
    /// `cutoff = anchor - ttl * unit`.
    pub fn new(anchor_millis: i64, ttl: i64, unit: TtlUnit) -> Result<Self, OverflowError> {
        let ttl_millis = unit.to_millis(ttl)?;
        Self::from_millis(anchor_millis, ttl_millis).ok_or(OverflowError { value: ttl, unit })
    }

    /// Period for a TTL already expressed in milliseconds. `None` when the
    /// TTL is negative or the cutoff would underflow.
    pub fn from_millis(anchor_millis: i64, ttl_millis: i64) -> Option<Self> {
        if ttl_millis < 0 {
            return None;
        }
        anchor_millis
            .checked_sub(ttl_millis)
            .map(|cutoff_millis| AgeOffPeriod {
                anchor_millis,
                cutoff_millis,
            })
    }

    /// A period whose cutoff equals its anchor: everything at or before the
    /// anchor ages off.
    pub fn at(anchor_millis: i64) -> Self {
        AgeOffPeriod {
            anchor_millis,
            cutoff_millis: anchor_millis,
        }
    }

    /// Cutoff after which no rule needs to be consulted.
    pub fn short_circuit(anchor_millis: i64, ttl: i64, unit: TtlUnit) -> Result<i64, OverflowError> {
        Self::new(anchor_millis, ttl, unit).map(|period| period.cutoff_millis)
    }

    /// Same anchor, different TTL. Used for per-record TTLs.
    #[inline]
    pub fn rebase(&self, ttl_millis: i64) -> Option<Self> {
        Self::from_millis(self.anchor_millis, ttl_millis)
    }

    pub fn anchor_millis(&self) -> i64 {
        self.anchor_millis
    }

    pub fn cutoff_millis(&self) -> i64 {
        self.cutoff_millis
    }

    pub fn ttl_millis(&self) -> i64 {
        self.anchor_millis - self.cutoff_millis
    }

    /// True when `timestamp` is still live under this period.
    #[inline]
    pub fn is_live(&self, timestamp: i64) -> bool {
        timestamp > self.cutoff_millis
    }
}

impl fmt::Display for AgeOffPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AgeOffPeriod[anchor={}, cutoff={}, ttl={}ms]",
            self.anchor_millis,
            self.cutoff_millis,
            self.ttl_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_computation() {
        let period = AgeOffPeriod::new(100_000, 30, TtlUnit::Seconds).unwrap();
        assert_eq!(period.anchor_millis(), 100_000);
        assert_eq!(period.cutoff_millis(), 70_000);
        assert_eq!(period.ttl_millis(), 30_000);
        assert!(period.cutoff_millis() <= period.anchor_millis());
    }

    #[test]
    fn test_is_live_is_strict() {
        let period = AgeOffPeriod::new(10_000, 5, TtlUnit::Seconds).unwrap();
        assert!(!period.is_live(5_000));
        assert!(period.is_live(5_001));
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(AgeOffPeriod::new(0, i64::MAX, TtlUnit::Hours).is_err());
        assert!(AgeOffPeriod::new(i64::MIN, 1, TtlUnit::Milliseconds).is_err());
        assert!(AgeOffPeriod::new(0, -5, TtlUnit::Seconds).is_err());
    }

    #[test]
    fn test_short_circuit_cutoff() {
        let cutoff = AgeOffPeriod::short_circuit(1_000_000, 2, TtlUnit::Minutes).unwrap();
        assert_eq!(cutoff, 1_000_000 - 120_000);
    }

    #[test]
    fn test_rebase_keeps_anchor() {
        let period = AgeOffPeriod::new(50_000, 1, TtlUnit::Seconds).unwrap();
        let rebased = period.rebase(10_000).unwrap();
        assert_eq!(rebased.anchor_millis(), 50_000);
        assert_eq!(rebased.cutoff_millis(), 40_000);
        assert!(period.rebase(-1).is_none());
    }
}
