//! Per-record-type field descriptors and the cross-type validation that
//! lets several record types share one physical index.
//!
//! Each record type registers a [`RecordSchema`]: a list of
//! [`FieldDescriptor`]s plus an optional inclusion predicate and eager-load
//! list. When a reader is built for a set of types, [`SchemaRegistry::validate`]
//! folds their descriptors into a single [`FieldMap`] that the query parser
//! consults for prefixes, value slots and range processors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::types::{FieldValue, Record};

/// Upper bound on the within-document frequency a single term may be given.
pub const MAX_TERM_WEIGHT: u32 = 32;

/// Field names the query parser reserves for boolean prefixes.
pub const RESERVED_FIELD_NAMES: [&str; 2] = ["model", "modelid"];

const RESERVED_CODES: [&str; 2] = ["M", "I"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Date,
    String,
    Number,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Date => "date",
            ValueKind::String => "string",
            ValueKind::Number => "number",
        }
    }

    /// Encode a record value for storage in a slot so that byte order
    /// matches the natural order of the kind.
    pub fn encode(self, field: &str, value: &FieldValue) -> Result<String> {
        if value.is_null() {
            return Ok(String::new());
        }
        match self {
            ValueKind::Date => value
                .as_date()
                .map(|d| d.format("%Y%m%d").to_string())
                .ok_or_else(|| Error::Coercion {
                    field: field.to_string(),
                    expected: "date",
                }),
            ValueKind::Number => value
                .as_f64()
                .map(sortable_number)
                .ok_or_else(|| Error::Coercion {
                    field: field.to_string(),
                    expected: "number",
                }),
            ValueKind::String => Ok(match value {
                FieldValue::Bool(b) => b.to_string(),
                other => other.as_text(),
            }),
        }
    }

    /// Encode one endpoint of a range typed into a query string. `None`
    /// means the endpoint is not valid for this kind.
    pub fn encode_bound(self, raw: &str) -> Option<String> {
        match self {
            ValueKind::String => Some(raw.to_string()),
            ValueKind::Number => raw.parse::<f64>().ok().map(sortable_number),
            ValueKind::Date => parse_query_date(raw).map(|d| d.format("%Y%m%d").to_string()),
        }
    }
}

fn parse_query_date(raw: &str) -> Option<NaiveDate> {
    ["%Y%m%d", "%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Order-preserving text encoding of an `f64`: 16 lowercase hex digits whose
/// lexicographic order equals numeric order.
pub fn sortable_number(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    format!("{ordered:016x}")
}

/// How one attribute of a record feeds the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDescriptor {
    /// Free text indexed under a short uppercase prefix code with a weight.
    Term {
        field: String,
        prefix: String,
        weight: u32,
    },
    /// A typed attribute stored in a numbered slot for sorting, collapsing
    /// and range filtering.
    Value {
        field: String,
        slot: u32,
        kind: ValueKind,
    },
    /// Unweighted, unprefixed free text.
    Text { field: String },
}

impl FieldDescriptor {
    pub fn field(&self) -> &str {
        match self {
            FieldDescriptor::Term { field, .. }
            | FieldDescriptor::Value { field, .. }
            | FieldDescriptor::Text { field } => field,
        }
    }
}

/// Hook that produces the value of a named field for a record. The default
/// reads the column of the same name.
pub trait FieldExtractor: Send + Sync {
    fn value(&self, record: &Record, field: &str) -> FieldValue;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnExtractor;

impl FieldExtractor for ColumnExtractor {
    fn value(&self, record: &Record, field: &str) -> FieldValue {
        record.get(field).cloned().unwrap_or(FieldValue::Null)
    }
}

impl<F> FieldExtractor for F
where
    F: Fn(&Record, &str) -> FieldValue + Send + Sync,
{
    fn value(&self, record: &Record, field: &str) -> FieldValue {
        self(record, field)
    }
}

#[derive(Clone)]
pub struct RecordSchema {
    pub record_type: String,
    pub fields: Vec<FieldDescriptor>,
    /// Field whose truthiness decides whether a record is indexed at all.
    pub include_if: Option<String>,
    /// Associations loaded alongside records when results are materialized.
    pub eager_load: Vec<String>,
    extractor: Arc<dyn FieldExtractor>,
}

impl fmt::Debug for RecordSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSchema")
            .field("record_type", &self.record_type)
            .field("fields", &self.fields)
            .field("include_if", &self.include_if)
            .field("eager_load", &self.eager_load)
            .finish_non_exhaustive()
    }
}

impl RecordSchema {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            fields: Vec::new(),
            include_if: None,
            eager_load: Vec::new(),
            extractor: Arc::new(ColumnExtractor),
        }
    }

    pub fn term(mut self, field: impl Into<String>, prefix: impl Into<String>, weight: u32) -> Self {
        self.fields.push(FieldDescriptor::Term {
            field: field.into(),
            prefix: prefix.into(),
            weight,
        });
        self
    }

    pub fn value(mut self, field: impl Into<String>, slot: u32, kind: ValueKind) -> Self {
        self.fields.push(FieldDescriptor::Value {
            field: field.into(),
            slot,
            kind,
        });
        self
    }

    pub fn text(mut self, field: impl Into<String>) -> Self {
        self.fields.push(FieldDescriptor::Text {
            field: field.into(),
        });
        self
    }

    pub fn include_if(mut self, field: impl Into<String>) -> Self {
        self.include_if = Some(field.into());
        self
    }

    pub fn eager_load(mut self, association: impl Into<String>) -> Self {
        self.eager_load.push(association.into());
        self
    }

    pub fn with_extractor(mut self, extractor: impl FieldExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn extract(&self, record: &Record, field: &str) -> FieldValue {
        self.extractor.value(record, field)
    }

    /// Whether the record belongs in the index.
    pub fn includes(&self, record: &Record) -> bool {
        self.include_if
            .as_deref()
            .is_none_or(|field| self.extract(record, field).truthy())
    }
}

/// Range syntax bound to one value slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeProcessor {
    pub slot: u32,
    pub kind: ValueKind,
    /// Value field name; number ranges must be written `name:lo..hi`.
    pub field: String,
}

/// Parser configuration for one set of record types.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    pub record_types: Vec<String>,
    prefix_by_field: BTreeMap<String, String>,
    field_by_prefix: BTreeMap<String, String>,
    slot_by_field: BTreeMap<String, u32>,
    field_by_slot: BTreeMap<u32, String>,
    kind_by_slot: BTreeMap<u32, ValueKind>,
    pub ranges: Vec<RangeProcessor>,
}

impl FieldMap {
    pub fn prefix_for(&self, field: &str) -> Option<&str> {
        self.prefix_by_field.get(field).map(String::as_str)
    }

    pub fn field_for_prefix(&self, prefix: &str) -> Option<&str> {
        self.field_by_prefix.get(prefix).map(String::as_str)
    }

    pub fn slot_for(&self, field: &str) -> Option<u32> {
        self.slot_by_field.get(field).copied()
    }

    pub fn field_for_slot(&self, slot: u32) -> Option<&str> {
        self.field_by_slot.get(&slot).map(String::as_str)
    }

    pub fn kind_for_slot(&self, slot: u32) -> Option<ValueKind> {
        self.kind_by_slot.get(&slot).copied()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entries: BTreeMap<String, RecordSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: RecordSchema) -> Result<()> {
        if self.entries.contains_key(&schema.record_type) {
            return Err(Error::Configuration(format!(
                "record type `{}` is already registered",
                schema.record_type
            )));
        }
        self.entries.insert(schema.record_type.clone(), schema);
        Ok(())
    }

    pub fn get(&self, record_type: &str) -> Result<&RecordSchema> {
        self.entries
            .get(record_type)
            .ok_or_else(|| Error::UnknownRecordType(record_type.to_string()))
    }

    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Fold the descriptors of `record_types` into one field map, rejecting
    /// any prefix or slot that two types use for different fields.
    pub fn validate<S: AsRef<str>>(&self, record_types: &[S]) -> Result<FieldMap> {
        let mut names: Vec<&str> = record_types.iter().map(AsRef::as_ref).collect();
        names.sort_unstable();
        names.dedup();

        let mut map = FieldMap {
            record_types: names.iter().map(|s| s.to_string()).collect(),
            ..FieldMap::default()
        };

        for name in names {
            let schema = self.get(name)?;
            for descriptor in &schema.fields {
                match descriptor {
                    FieldDescriptor::Term { field, prefix, .. } => {
                        check_prefix(name, field, prefix)?;
                        bind(&mut map.prefix_by_field, field, prefix, |existing| {
                            format!(
                                "field `{field}` of {name} uses prefix `{prefix}` but another type uses `{existing}`"
                            )
                        })?;
                        bind(&mut map.field_by_prefix, prefix, field, |existing| {
                            format!(
                                "prefix `{prefix}` is used for `{field}` by {name} and for `{existing}` elsewhere"
                            )
                        })?;
                    }
                    FieldDescriptor::Value { field, slot, kind } => {
                        check_field_name(name, field)?;
                        if let Some(existing) = map.field_by_slot.get(slot)
                            && existing != field
                        {
                            return Err(Error::SchemaConflict(format!(
                                "value slot {slot} is used for `{existing}` and for `{field}` ({name})"
                            )));
                        }
                        if *kind != ValueKind::Date
                            && let Some(existing) = map.slot_by_field.get(field)
                            && existing != slot
                        {
                            return Err(Error::SchemaConflict(format!(
                                "{} field `{field}` is in slot {existing} and in slot {slot} ({name})",
                                kind.as_str()
                            )));
                        }
                        map.field_by_slot.insert(*slot, field.clone());
                        map.slot_by_field.entry(field.clone()).or_insert(*slot);
                        if !map.kind_by_slot.contains_key(slot) {
                            map.kind_by_slot.insert(*slot, *kind);
                            map.ranges.push(RangeProcessor {
                                slot: *slot,
                                kind: *kind,
                                field: field.clone(),
                            });
                        }
                    }
                    FieldDescriptor::Text { .. } => {}
                }
            }
        }

        // Prefixed number ranges are tried before the catch-all string ranges.
        map.ranges
            .sort_by_key(|range| range.kind != ValueKind::Number);
        Ok(map)
    }
}

fn bind(
    map: &mut BTreeMap<String, String>,
    key: &str,
    value: &str,
    conflict: impl FnOnce(&str) -> String,
) -> Result<()> {
    match map.get(key) {
        Some(existing) if existing != value => Err(Error::SchemaConflict(conflict(existing))),
        Some(_) => Ok(()),
        None => {
            map.insert(key.to_string(), value.to_string());
            Ok(())
        }
    }
}

fn check_field_name(record_type: &str, field: &str) -> Result<()> {
    if RESERVED_FIELD_NAMES.contains(&field) {
        return Err(Error::SchemaConflict(format!(
            "{record_type}: field name `{field}` is reserved"
        )));
    }
    Ok(())
}

fn check_prefix(record_type: &str, field: &str, prefix: &str) -> Result<()> {
    check_field_name(record_type, field)?;
    let well_formed =
        (1..=3).contains(&prefix.len()) && prefix.bytes().all(|b| b.is_ascii_uppercase());
    if !well_formed {
        return Err(Error::SchemaConflict(format!(
            "{record_type}: prefix `{prefix}` for `{field}` must be one to three uppercase letters"
        )));
    }
    if RESERVED_CODES.contains(&prefix) {
        return Err(Error::SchemaConflict(format!(
            "{record_type}: prefix `{prefix}` is reserved for type and id tags"
        )));
    }
    if prefix == "Z" {
        return Err(Error::SchemaConflict(format!(
            "{record_type}: prefix `Z` marks stemmed terms"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn article() -> RecordSchema {
        RecordSchema::new("Article")
            .term("title", "S", 2)
            .value("created_at", 0, ValueKind::Date)
            .value("rank", 1, ValueKind::Number)
            .text("body")
    }

    #[test]
    fn consistent_types_share_a_field_map() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        registry
            .register(
                RecordSchema::new("Page")
                    .term("title", "S", 1)
                    .value("created_at", 0, ValueKind::Date),
            )
            .unwrap();

        let map = registry.validate(&["Page", "Article"]).unwrap();
        assert_eq!(map.record_types, vec!["Article", "Page"]);
        assert_eq!(map.prefix_for("title"), Some("S"));
        assert_eq!(map.field_for_prefix("S"), Some("title"));
        assert_eq!(map.slot_for("rank"), Some(1));
        assert_eq!(map.ranges.len(), 2);
        assert_eq!(map.ranges[0].kind, ValueKind::Number);
    }

    #[test]
    fn a_prefix_bound_to_two_fields_is_a_conflict() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        registry
            .register(RecordSchema::new("User").term("name", "S", 1))
            .unwrap();
        let err = registry.validate(&["Article", "User"]).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)), "{err}");
    }

    #[test]
    fn a_field_bound_to_two_prefixes_is_a_conflict() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        registry
            .register(RecordSchema::new("User").term("title", "T", 1))
            .unwrap();
        assert!(matches!(
            registry.validate(&["Article", "User"]),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn a_slot_shared_by_two_fields_is_a_conflict() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        registry
            .register(RecordSchema::new("User").value("joined_at", 0, ValueKind::Date))
            .unwrap();
        assert!(matches!(
            registry.validate(&["Article", "User"]),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn number_fields_keep_their_slot_across_types() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        registry
            .register(RecordSchema::new("User").value("rank", 5, ValueKind::Number))
            .unwrap();
        assert!(matches!(
            registry.validate(&["Article", "User"]),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn reserved_and_malformed_prefixes_are_rejected() {
        for prefix in ["M", "I", "Z", "s", "ABCD", ""] {
            let mut registry = SchemaRegistry::new();
            registry
                .register(RecordSchema::new("Note").term("title", prefix, 1))
                .unwrap();
            assert!(
                matches!(registry.validate(&["Note"]), Err(Error::SchemaConflict(_))),
                "prefix {prefix:?} should be rejected"
            );
        }

        let mut registry = SchemaRegistry::new();
        registry
            .register(RecordSchema::new("Note").term("model", "N", 1))
            .unwrap();
        assert!(registry.validate(&["Note"]).is_err());
    }

    #[test]
    fn longer_codes_may_start_with_z() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(RecordSchema::new("Note").term("zone", "ZA", 1))
            .unwrap();
        let map = registry.validate(&["Note"]).unwrap();
        assert_eq!(map.prefix_for("zone"), Some("ZA"));
    }

    #[test]
    fn unknown_types_and_duplicate_registration_are_errors() {
        let mut registry = SchemaRegistry::new();
        registry.register(article()).unwrap();
        assert!(matches!(
            registry.validate(&["Ghost"]),
            Err(Error::UnknownRecordType(_))
        ));
        assert!(matches!(
            registry.register(article()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn inclusion_predicate_uses_the_extractor() {
        let schema = article().include_if("published");
        let draft = Record::new("Article", 1).with("published", 0);
        let live = Record::new("Article", 2).with("published", 1);
        assert!(!schema.includes(&draft));
        assert!(schema.includes(&live));
        assert!(article().includes(&draft));

        let computed = article()
            .include_if("visible")
            .with_extractor(|record: &Record, field: &str| match field {
                "visible" => FieldValue::Bool(record.id % 2 == 0),
                other => record.get(other).cloned().unwrap_or(FieldValue::Null),
            });
        assert!(computed.includes(&live));
        assert!(!computed.includes(&draft));
    }

    #[test]
    fn values_encode_by_kind() {
        let date = ValueKind::Date
            .encode("created_at", &FieldValue::from("2023-07-04"))
            .unwrap();
        assert_eq!(date, "20230704");
        assert!(matches!(
            ValueKind::Date.encode("created_at", &FieldValue::from("soon")),
            Err(Error::Coercion { .. })
        ));
        assert_eq!(
            ValueKind::String
                .encode("flag", &FieldValue::Bool(true))
                .unwrap(),
            "true"
        );
        assert_eq!(ValueKind::Number.encode("n", &FieldValue::Null).unwrap(), "");
        assert_eq!(ValueKind::Date.encode_bound("01/02/2020").unwrap(), "20200201");
        assert!(ValueKind::Date.encode_bound("abc").is_none());
    }

    proptest! {
        #[test]
        fn sortable_numbers_preserve_order(a in -1.0e12f64..1.0e12, b in -1.0e12f64..1.0e12) {
            let (ea, eb) = (sortable_number(a), sortable_number(b));
            prop_assert_eq!(a.partial_cmp(&b), ea.partial_cmp(&eb));
        }
    }
}
