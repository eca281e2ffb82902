//! Access to the relational records the index is built from.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use itertools::Itertools;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::types::{FieldValue, Record};

/// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const ID_CHUNK: usize = 500;

/// Relational narrowing and eager loading applied when records are fetched
/// for a result page.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// SQL boolean expression; `?` placeholders bind to `params` in order.
    pub conditions: Option<String>,
    pub params: Vec<SqlValue>,
    /// Join clause appended after the table name. Must not contain
    /// placeholders.
    pub joins: Option<String>,
    /// Associations to load alongside each record.
    pub include: Vec<String>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions(mut self, sql: impl Into<String>, params: impl IntoIterator<Item = SqlValue>) -> Self {
        self.conditions = Some(sql.into());
        self.params = params.into_iter().collect();
        self
    }

    pub fn joins(mut self, sql: impl Into<String>) -> Self {
        self.joins = Some(sql.into());
        self
    }

    pub fn include(mut self, association: impl Into<String>) -> Self {
        self.include.push(association.into());
        self
    }

    /// Whether these options can exclude records that the index matched.
    pub fn is_filtering(&self) -> bool {
        self.conditions.is_some() || self.joins.is_some()
    }
}

/// The relational store seen by the indexer and the result materializer.
pub trait RecordStore {
    /// Records of `record_type` among `ids` that satisfy `options`, in any
    /// order. Missing ids are skipped.
    fn find(&self, record_type: &str, ids: &[i64], options: &FindOptions) -> Result<Vec<Record>>;

    /// The subset of `ids` that satisfies the filter in `options`.
    fn filter_ids(&self, record_type: &str, ids: &[i64], options: &FindOptions) -> Result<Vec<i64>> {
        let narrowed = FindOptions {
            include: Vec::new(),
            ..options.clone()
        };
        Ok(self
            .find(record_type, ids, &narrowed)?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Up to `limit` primary keys greater than `after`, ascending.
    fn ids_after(&self, record_type: &str, after: Option<i64>, limit: usize) -> Result<Vec<i64>>;

    fn find_one(&self, record_type: &str, id: i64) -> Result<Option<Record>> {
        Ok(self
            .find(record_type, &[id], &FindOptions::default())?
            .into_iter()
            .next())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMapping {
    pub name: String,
    pub record_type: String,
    pub table: String,
    pub foreign_key: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub record_type: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub associations: Vec<AssociationMapping>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl TableMapping {
    pub fn new(record_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            table: table.into(),
            primary_key: default_primary_key(),
            associations: Vec::new(),
        }
    }

    pub fn has_many(
        mut self,
        name: impl Into<String>,
        record_type: impl Into<String>,
        table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.push(AssociationMapping {
            name: name.into(),
            record_type: record_type.into(),
            table: table.into(),
            foreign_key: foreign_key.into(),
            primary_key: default_primary_key(),
        });
        self
    }
}

pub struct SqliteRecordStore {
    conn: Connection,
    tables: BTreeMap<String, TableMapping>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path, tables: impl IntoIterator<Item = TableMapping>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn, tables))
    }

    pub fn from_connection(conn: Connection, tables: impl IntoIterator<Item = TableMapping>) -> Self {
        Self {
            conn,
            tables: tables
                .into_iter()
                .map(|t| (t.record_type.clone(), t))
                .collect(),
        }
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    fn mapping(&self, record_type: &str) -> Result<&TableMapping> {
        self.tables.get(record_type).ok_or_else(|| {
            Error::Configuration(format!("no table mapping for record type `{record_type}`"))
        })
    }

    /// Insert or replace the row backing `record`.
    pub fn upsert(&self, record: &Record) -> Result<()> {
        let mapping = self.mapping(&record.record_type)?;
        let mut columns = vec![quote(&mapping.primary_key)];
        let mut values = vec![SqlValue::Integer(record.id)];
        for (name, value) in &record.fields {
            if *name == mapping.primary_key {
                continue;
            }
            columns.push(quote(name));
            values.push(to_sql_value(value));
        }
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(&mapping.table),
            columns.join(", "),
            placeholders(values.len())
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    pub fn delete(&self, record_type: &str, id: i64) -> Result<bool> {
        let mapping = self.mapping(record_type)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote(&mapping.table),
            quote(&mapping.primary_key)
        );
        Ok(self.conn.execute(&sql, [id])? > 0)
    }

    fn select_where_ids(
        mapping: &TableMapping,
        projection: &str,
        chunk_len: usize,
        options: &FindOptions,
    ) -> String {
        let table = quote(&mapping.table);
        let mut sql = format!("SELECT DISTINCT {projection} FROM {table}");
        if let Some(joins) = &options.joins {
            sql.push(' ');
            sql.push_str(joins);
        }
        sql.push_str(&format!(
            " WHERE {table}.{} IN ({})",
            quote(&mapping.primary_key),
            placeholders(chunk_len)
        ));
        if let Some(conditions) = &options.conditions {
            sql.push_str(&format!(" AND ({conditions})"));
        }
        sql
    }

    fn load_associations(&self, mapping: &TableMapping, records: &mut [Record], include: &[String]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let parent_ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        for name in include {
            let association = mapping
                .associations
                .iter()
                .find(|a| &a.name == name)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "record type `{}` has no association `{name}`",
                        mapping.record_type
                    ))
                })?;

            let mut children: HashMap<i64, Vec<Record>> = HashMap::new();
            for chunk in parent_ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "SELECT * FROM {} WHERE {} IN ({}) ORDER BY {}",
                    quote(&association.table),
                    quote(&association.foreign_key),
                    placeholders(chunk.len()),
                    quote(&association.primary_key)
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
                while let Some(row) = rows.next()? {
                    let child = record_from_row(
                        &association.record_type,
                        &association.primary_key,
                        &columns,
                        row,
                    )?;
                    if let Some(FieldValue::Integer(parent)) = child.get(&association.foreign_key) {
                        children.entry(*parent).or_default().push(child);
                    }
                }
            }

            for record in records.iter_mut() {
                let loaded = children.remove(&record.id).unwrap_or_default();
                record.associations.insert(name.clone(), loaded);
            }
        }
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn find(&self, record_type: &str, ids: &[i64], options: &FindOptions) -> Result<Vec<Record>> {
        let mapping = self.mapping(record_type)?;
        let mut records = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        let projection = format!("{}.*", quote(&mapping.table));
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = Self::select_where_ids(mapping, &projection, chunk.len(), options);
            let mut stmt = self.conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let bound = chunk
                .iter()
                .map(|id| SqlValue::Integer(*id))
                .chain(options.params.iter().cloned());
            let mut rows = stmt.query(params_from_iter(bound))?;
            while let Some(row) = rows.next()? {
                let record = record_from_row(record_type, &mapping.primary_key, &columns, row)?;
                if seen.insert(record.id) {
                    records.push(record);
                }
            }
        }
        self.load_associations(mapping, &mut records, &options.include)?;
        Ok(records)
    }

    fn filter_ids(&self, record_type: &str, ids: &[i64], options: &FindOptions) -> Result<Vec<i64>> {
        let mapping = self.mapping(record_type)?;
        let projection = format!("{}.{}", quote(&mapping.table), quote(&mapping.primary_key));
        let mut kept = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = Self::select_where_ids(mapping, &projection, chunk.len(), options);
            let mut stmt = self.conn.prepare(&sql)?;
            let bound = chunk
                .iter()
                .map(|id| SqlValue::Integer(*id))
                .chain(options.params.iter().cloned());
            let rows = stmt.query_map(params_from_iter(bound), |row| row.get::<_, i64>(0))?;
            for id in rows {
                kept.push(id?);
            }
        }
        Ok(kept)
    }

    fn ids_after(&self, record_type: &str, after: Option<i64>, limit: usize) -> Result<Vec<i64>> {
        let mapping = self.mapping(record_type)?;
        let pk = quote(&mapping.primary_key);
        let sql = format!(
            "SELECT {pk} FROM {} WHERE ?1 IS NULL OR {pk} > ?1 ORDER BY {pk} ASC LIMIT ?2",
            quote(&mapping.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(rusqlite::params![after, limit], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).join(",")
}

fn to_sql_value(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        FieldValue::Integer(i) => SqlValue::Integer(*i),
        FieldValue::Float(f) => SqlValue::Real(*f),
        FieldValue::Date(d) => SqlValue::Text(d.to_rfc3339()),
        FieldValue::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn record_from_row(record_type: &str, primary_key: &str, columns: &[String], row: &Row<'_>) -> Result<Record> {
    let mut record = Record::new(record_type, 0);
    for (idx, name) in columns.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null | ValueRef::Blob(_) => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(f) => FieldValue::Float(f),
            ValueRef::Text(bytes) => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        };
        if name == primary_key {
            if let FieldValue::Integer(id) = value {
                record.id = id;
            }
            continue;
        }
        record.fields.insert(name.clone(), value);
    }
    Ok(record)
}
