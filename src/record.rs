//! The host store's view of a single record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named byte-string fields a rule may inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Row,
    ColumnFamily,
    ColumnQualifier,
    ColumnVisibility,
    Value,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Row => "row",
            Field::ColumnFamily => "column_family",
            Field::ColumnQualifier => "column_qualifier",
            Field::ColumnVisibility => "column_visibility",
            Field::Value => "value",
        };
        f.write_str(name)
    }
}

/// Read-only access to a stored record.
///
/// The timestamp is already decoded from any host-specific encoding and
/// compares monotonically with cutoff values.
pub trait RecordView {
    fn age_off_timestamp(&self) -> i64;

    fn field(&self, field: Field) -> &[u8];
}

/// An owned record, for hosts without their own key type and for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub row: Vec<u8>,
    pub column_family: Vec<u8>,
    pub column_qualifier: Vec<u8>,
    pub column_visibility: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Record {
    pub fn new(timestamp: i64) -> Self {
        Record {
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_row(mut self, row: impl Into<Vec<u8>>) -> Self {
        self.row = row.into();
        self
    }

    pub fn with_column_family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.column_family = family.into();
        self
    }

    pub fn with_column_qualifier(mut self, qualifier: impl Into<Vec<u8>>) -> Self {
        self.column_qualifier = qualifier.into();
        self
    }

    pub fn with_visibility(mut self, visibility: impl Into<Vec<u8>>) -> Self {
        self.column_visibility = visibility.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }
}

impl RecordView for Record {
    #[inline]
    fn age_off_timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    fn field(&self, field: Field) -> &[u8] {
        match field {
            Field::Row => &self.row,
            Field::ColumnFamily => &self.column_family,
            Field::ColumnQualifier => &self.column_qualifier,
            Field::ColumnVisibility => &self.column_visibility,
            Field::Value => &self.value,
        }
    }
}
