//! Rules whose TTL depends on the record itself.
//!
//! - [`FieldTtlRule`]: scans a field with a [`TokenTtlTrie`]; the matched
//!   token's TTL becomes a per-record period.
//! - [`FieldNameRule`]: looks up the record's field name in a per-field TTL
//!   table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::definition::RuleDefinition;
use super::{CompileContext, RuleVerdict};
use crate::error::ConfigError;
use crate::period::AgeOffPeriod;
use crate::record::{Field, RecordView};
use crate::trie::{TokenSpecParser, TokenTtlTrie, TokenTtlTrieBuilder};
use crate::units::TtlUnit;

/// Verdict for a matched record under a per-record TTL.
#[inline]
fn per_record_verdict(period: &AgeOffPeriod, ttl_millis: i64, timestamp: i64) -> RuleVerdict {
    match period.rebase(ttl_millis) {
        Some(record_period) => RuleVerdict::applied(record_period.is_live(timestamp)),
        // unclassifiable, keep it
        None => RuleVerdict::applied(true),
    }
}

// ================================================================================================
// FIELD TTL (token trie)
// ================================================================================================

/// Scans one field for the configured tokens and ages the record off by the
/// TTL of the best-priority token found.
#[derive(Debug, Clone)]
pub struct FieldTtlRule {
    trie: Option<Arc<TokenTtlTrie>>,
    field: Field,
    default_ttl_millis: Option<i64>,
}

impl FieldTtlRule {
    pub fn compile(def: &RuleDefinition, ctx: &CompileContext) -> Result<Self, ConfigError> {
        let default_ttl_millis = ctx.ttl_millis(def)?;

        let trie = match def.match_pattern.as_deref() {
            Some(pattern) => {
                let mut builder = TokenTtlTrieBuilder::new();
                builder.set_merge(ctx.merge).set_default_ttl(default_ttl_millis);
                if let Some(delimiters) = def.delimiters.as_ref() {
                    builder.set_delimiters(delimiters.as_bytes());
                }
                TokenSpecParser::new(&mut builder).parse(pattern)?;
                Some(Arc::new(builder.build()?))
            }
            None => None,
        };

        Ok(Self {
            trie,
            field: def.field.unwrap_or(Field::ColumnQualifier),
            default_ttl_millis,
        })
    }

    pub fn trie(&self) -> Option<&Arc<TokenTtlTrie>> {
        self.trie.as_ref()
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn default_ttl_millis(&self) -> Option<i64> {
        self.default_ttl_millis
    }

    #[inline]
    pub fn evaluate<R: RecordView + ?Sized>(&self, period: &AgeOffPeriod, record: &R) -> RuleVerdict {
        let Some(trie) = self.trie.as_ref() else {
            return RuleVerdict::NOT_APPLIED;
        };
        match trie.scan(record.field(self.field)) {
            Some(ttl_millis) => per_record_verdict(period, ttl_millis, record.age_off_timestamp()),
            None => RuleVerdict::NOT_APPLIED,
        }
    }
}

impl fmt::Display for FieldTtlRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldTtl[field={}, tokens=", self.field)?;
        match &self.trie {
            Some(trie) => write!(f, "{}]", trie),
            None => f.write_str("none]"),
        }
    }
}

// ================================================================================================
// FIELD NAME
// ================================================================================================

pub const FIELDS_OPTION: &str = "fields";
pub const INDEX_TABLE_OPTION: &str = "isindextable";
pub const EXCLUDE_DATA_OPTION: &str = "excludeData";
const FIELD_KEY_PREFIX: &str = "field.";
const FIELD_TTL_SUFFIX: &str = ".ttl";
const FIELD_UNITS_SUFFIX: &str = ".ttlUnits";
/// Column family prefix of field-index keys.
const FIELD_INDEX_FAMILY: &[u8] = b"fi\0";

/// Ages off records by the TTL configured for their field name.
///
/// Field names come from `fields` (comma separated) and from every
/// `field.<name>.ttl` option. A field's ttl is read from `field.<name>.ttl`,
/// then the legacy `<name>.ttl`, in the units of `field.<name>.ttlUnits` or
/// else the rule's; fields with neither use the rule TTL.
///
/// The field name is the column family in index tables. Otherwise it is the
/// suffix of a `fi\0<field>` column family for field-index keys, and the
/// column qualifier up to the first NUL byte for event keys. `excludeData`
/// (`event`, `index` or both, comma separated) stops the rule from applying
/// to that kind of key.
#[derive(Debug, Clone)]
pub struct FieldNameRule {
    field_ttls: HashMap<Vec<u8>, i64>,
    index_table: bool,
    exclude_event: bool,
    exclude_index: bool,
    default_ttl_millis: Option<i64>,
}

impl FieldNameRule {
    pub fn compile(def: &RuleDefinition, ctx: &CompileContext) -> Result<Self, ConfigError> {
        let default_ttl_millis = ctx.ttl_millis(def)?;
        let units = ctx.units_for(def);

        let index_table = match def.options.get(INDEX_TABLE_OPTION).map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidOption {
                    name: INDEX_TABLE_OPTION.to_string(),
                    value: other.to_string(),
                })
            }
        };

        let (mut exclude_event, mut exclude_index) = (false, false);
        if let Some(raw) = def.options.get(EXCLUDE_DATA_OPTION) {
            for kind in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                match kind {
                    "event" => exclude_event = true,
                    "index" => exclude_index = true,
                    _ => {
                        return Err(ConfigError::InvalidOption {
                            name: EXCLUDE_DATA_OPTION.to_string(),
                            value: raw.clone(),
                        })
                    }
                }
            }
        }

        let mut field_ttls = HashMap::new();
        let fields = def.options.get(FIELDS_OPTION).map(String::as_str).unwrap_or("");
        for name in fields.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let ttl_millis = match field_ttl(def, name, units)? {
                Some(ttl_millis) => ttl_millis,
                None => default_ttl_millis.ok_or_else(|| ConfigError::MissingTtl {
                    context: format!("field \"{}\"", name),
                })?,
            };
            field_ttls.insert(name.as_bytes().to_vec(), ttl_millis);
        }

        // fields named only by their field.<name>.ttl option
        let unlisted: Vec<&str> = def
            .options
            .keys()
            .filter_map(|key| key.strip_prefix(FIELD_KEY_PREFIX)?.strip_suffix(FIELD_TTL_SUFFIX))
            .filter(|name| !name.is_empty() && !field_ttls.contains_key(name.as_bytes()))
            .collect();
        for name in unlisted {
            if let Some(ttl_millis) = field_ttl(def, name, units)? {
                field_ttls.insert(name.as_bytes().to_vec(), ttl_millis);
            }
        }

        Ok(Self {
            field_ttls,
            index_table,
            exclude_event,
            exclude_index,
            default_ttl_millis,
        })
    }

    pub fn default_ttl_millis(&self) -> Option<i64> {
        self.default_ttl_millis
    }

    pub fn is_index_table(&self) -> bool {
        self.index_table
    }

    /// TTL registered for `field`, in milliseconds.
    pub fn field_ttl_millis(&self, field: &[u8]) -> Option<i64> {
        self.field_ttls.get(field).copied()
    }

    /// Field name of `record` as this rule sees it, or `None` when its kind
    /// of key is excluded.
    pub fn field_name<'r, R: RecordView + ?Sized>(&self, record: &'r R) -> Option<&'r [u8]> {
        let family = record.field(Field::ColumnFamily);
        if self.index_table {
            return Some(family);
        }
        if let Some(name) = family.strip_prefix(FIELD_INDEX_FAMILY) {
            return (!self.exclude_index).then_some(name);
        }
        if self.exclude_event {
            return None;
        }
        let qualifier = record.field(Field::ColumnQualifier);
        let end = qualifier.iter().position(|&b| b == 0).unwrap_or(qualifier.len());
        Some(&qualifier[..end])
    }

    #[inline]
    pub fn evaluate<R: RecordView + ?Sized>(&self, period: &AgeOffPeriod, record: &R) -> RuleVerdict {
        match self.field_name(record).and_then(|name| self.field_ttls.get(name)) {
            Some(&ttl_millis) => per_record_verdict(period, ttl_millis, record.age_off_timestamp()),
            None => RuleVerdict::NOT_APPLIED,
        }
    }
}

/// Explicit ttl of `name`, if any, in milliseconds.
fn field_ttl(def: &RuleDefinition, name: &str, rule_units: TtlUnit) -> Result<Option<i64>, ConfigError> {
    let revised = format!("{}{}{}", FIELD_KEY_PREFIX, name, FIELD_TTL_SUFFIX);
    let legacy = format!("{}{}", name, FIELD_TTL_SUFFIX);
    let Some(raw) = def.options.get(&revised).or_else(|| def.options.get(&legacy)) else {
        return Ok(None);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidTtl(raw.clone()))?;

    let units_key = format!("{}{}{}", FIELD_KEY_PREFIX, name, FIELD_UNITS_SUFFIX);
    let units = match def.options.get(&units_key) {
        Some(raw_units) => raw_units.trim().parse::<TtlUnit>()?,
        None => rule_units,
    };
    Ok(Some(units.to_millis(value)?))
}

impl fmt::Display for FieldNameRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<String> = self
            .field_ttls
            .iter()
            .map(|(name, ttl)| format!("{:?}:{}ms", String::from_utf8_lossy(name), ttl))
            .collect();
        fields.sort();
        write!(f, "FieldName[index_table={}, ", self.index_table)?;
        match (self.exclude_event, self.exclude_index) {
            (true, true) => f.write_str("exclude=event|index, ")?,
            (true, false) => f.write_str("exclude=event, ")?,
            (false, true) => f.write_str("exclude=index, ")?,
            (false, false) => {}
        }
        write!(f, "fields={{{}}}]", fields.join(", "))
    }
}
