//! Records, field values, document keys and index jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A scalar read from the relational store or produced by a field extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Date(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Free-text rendering used when the value is fed to the term generator.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Date(d) => d.to_rfc3339(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    /// Interpret the value as a point in time. Integers are epoch millis,
    /// text may be RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Date(d) => Some(*d),
            FieldValue::Integer(ms) => DateTime::from_timestamp_millis(*ms),
            FieldValue::Text(s) => parse_date_text(s.trim()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness for inclusion predicates: null, false, zero and empty
    /// strings (or "false"/"0") are false.
    pub fn truthy(&self) -> bool {
        match self {
            FieldValue::Null => false,
            FieldValue::Bool(b) => *b,
            FieldValue::Integer(i) => *i != 0,
            FieldValue::Float(f) => *f != 0.0,
            FieldValue::Date(_) => true,
            FieldValue::Text(s) => {
                let s = s.trim();
                !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
            }
        }
    }
}

fn parse_date_text(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

/// A row of some record type together with any eagerly loaded associations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub record_type: String,
    pub id: i64,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub associations: BTreeMap<String, Vec<Record>>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, id: i64) -> Self {
        Self {
            record_type: record_type.into(),
            id,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(self.record_type.clone(), self.id)
    }
}

/// Identity of an indexed document: `"{record_type}-{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub record_type: String,
    pub id: i64,
}

impl DocKey {
    pub fn new(record_type: impl Into<String>, id: i64) -> Self {
        Self {
            record_type: record_type.into(),
            id,
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.record_type, self.id)
    }
}

impl FromStr for DocKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (record_type, id) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("document key `{s}` has no `-` separator"))?;
        // "Article--3" is type `Article` with id -3.
        let (record_type, id) = match record_type.strip_suffix('-') {
            Some(record_type) => (record_type, format!("-{id}")),
            None => (record_type, id.to_string()),
        };
        if record_type.is_empty() {
            return Err(format!("document key `{s}` has an empty record type"));
        }
        let id = id
            .parse()
            .map_err(|_| format!("document key `{s}` has a non-numeric id"))?;
        Ok(DocKey::new(record_type, id))
    }
}

/// Anything that can name its own indexed document.
pub trait Indexed {
    fn doc_key(&self) -> DocKey;
}

impl Indexed for DocKey {
    fn doc_key(&self) -> DocKey {
        self.clone()
    }
}

impl Indexed for Record {
    fn doc_key(&self) -> DocKey {
        self.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Update,
    Destroy,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Update => "update",
            JobAction::Destroy => "destroy",
        }
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(JobAction::Update),
            "destroy" => Ok(JobAction::Destroy),
            other => Err(format!("unknown job action `{other}`")),
        }
    }
}

/// A pending index mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub record_type: String,
    pub record_id: i64,
    pub action: JobAction,
    pub created_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Job {
    pub fn key(&self) -> DocKey {
        DocKey::new(self.record_type.clone(), self.record_id)
    }
}
