//! Search configuration via `search.toml`
//!
//! Record types, their table mappings and the index location are declared in
//! a TOML file in the data directory. `RSEARCH_*` environment variables (and a
//! `.env` file) override the file.
//!
//! ```toml
//! environment = "production"
//! max_job_attempts = 5
//!
//! [[record_type]]
//! name = "Article"
//! table = "articles"
//! terms = [{ field = "title", prefix = "S", weight = 2 }]
//! values = [{ field = "published_on", slot = 0, kind = "date" }]
//! texts = ["body"]
//! include_if = "visible"
//! eager_load = ["comments"]
//! associations = [{ name = "comments", record_type = "Comment", table = "comments", foreign_key = "article_id" }]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::schema::{RecordSchema, SchemaRegistry, ValueKind};
use crate::storage::{AssociationMapping, TableMapping};

/// Config file name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "search.toml";

const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_WRITER_HEAP: usize = 50_000_000;
const DEFAULT_REBUILD_BATCH: usize = 1000;
const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermConfig {
    pub field: String,
    pub prefix: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueConfig {
    pub field: String,
    pub slot: u32,
    #[serde(default = "default_kind")]
    pub kind: ValueKind,
}

fn default_kind() -> ValueKind {
    ValueKind::String
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeConfig {
    pub name: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub terms: Vec<TermConfig>,
    #[serde(default)]
    pub values: Vec<ValueConfig>,
    #[serde(default)]
    pub texts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_if: Option<String>,
    #[serde(default)]
    pub eager_load: Vec<String>,
    #[serde(default)]
    pub associations: Vec<AssociationMapping>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl RecordTypeConfig {
    pub fn schema(&self) -> RecordSchema {
        let mut schema = RecordSchema::new(&self.name);
        for term in &self.terms {
            schema = schema.term(&term.field, &term.prefix, term.weight);
        }
        for value in &self.values {
            schema = schema.value(&value.field, value.slot, value.kind);
        }
        for text in &self.texts {
            schema = schema.text(text);
        }
        if let Some(field) = &self.include_if {
            schema = schema.include_if(field);
        }
        for association in &self.eager_load {
            schema = schema.eager_load(association);
        }
        schema
    }

    pub fn table_mapping(&self) -> TableMapping {
        TableMapping {
            record_type: self.name.clone(),
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            associations: self.associations.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Selects the index directory under `<data_dir>/indexes/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_heap_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_job_attempts: Option<u32>,
    #[serde(default, rename = "record_type")]
    pub record_types: Vec<RecordTypeConfig>,
}

impl SearchConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse search config TOML")
    }

    /// Load `config_path` (or `search.toml` in the data directory when it
    /// exists), then apply environment overrides. An explicit `data_dir`
    /// wins over both.
    pub fn load(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self> {
        let env_data_dir = dotenvy::var("RSEARCH_DATA_DIR").ok().map(PathBuf::from);
        let lookup_dir = data_dir
            .clone()
            .or_else(|| env_data_dir.clone())
            .unwrap_or_else(crate::default_data_dir);

        let mut config = match config_path {
            Some(path) => Self::read(path)?,
            None => {
                let path = lookup_dir.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Self::read(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        if let Some(dir) = data_dir {
            config.data_dir = Some(dir);
        }
        if config.data_dir.is_none() {
            config.data_dir = Some(lookup_dir);
        }
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = dotenvy::var("RSEARCH_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(env) = dotenvy::var("RSEARCH_ENV") {
            self.environment = Some(env);
        }
        if let Ok(path) = dotenvy::var("RSEARCH_INDEX_PATH") {
            self.index_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = dotenvy::var("RSEARCH_DB") {
            self.db = Some(PathBuf::from(path));
        }
        if let Ok(val) = dotenvy::var("RSEARCH_MAX_JOB_ATTEMPTS") {
            self.max_job_attempts = Some(
                val.parse()
                    .with_context(|| format!("RSEARCH_MAX_JOB_ATTEMPTS={val} is not a number"))?,
            );
        }
        if let Ok(val) = dotenvy::var("RSEARCH_WRITER_HEAP") {
            self.writer_heap_bytes = Some(
                val.parse()
                    .with_context(|| format!("RSEARCH_WRITER_HEAP={val} is not a byte count"))?,
            );
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(crate::default_data_dir)
    }

    pub fn environment(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("indexes").join(self.environment()))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| self.data_dir().join("records.db"))
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            index_path: self.index_path(),
            writer_heap_bytes: self.writer_heap_bytes.unwrap_or(DEFAULT_WRITER_HEAP),
            rebuild_batch_size: self.rebuild_batch_size.unwrap_or(DEFAULT_REBUILD_BATCH),
            max_job_attempts: self.max_job_attempts.unwrap_or(DEFAULT_MAX_JOB_ATTEMPTS),
        }
    }

    pub fn schema_registry(&self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for record_type in &self.record_types {
            registry
                .register(record_type.schema())
                .with_context(|| format!("Invalid record type `{}`", record_type.name))?;
        }
        Ok(registry)
    }

    pub fn table_mappings(&self) -> Vec<TableMapping> {
        self.record_types
            .iter()
            .map(RecordTypeConfig::table_mapping)
            .collect()
    }
}

/// The settings the indexing core needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub index_path: PathBuf,
    pub writer_heap_bytes: usize,
    pub rebuild_batch_size: usize,
    /// 0 disables quarantine.
    pub max_job_attempts: u32,
}

impl IndexConfig {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            writer_heap_bytes: DEFAULT_WRITER_HEAP,
            rebuild_batch_size: DEFAULT_REBUILD_BATCH,
            max_job_attempts: DEFAULT_MAX_JOB_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    const SAMPLE: &str = r#"
environment = "test"
max_job_attempts = 3

[[record_type]]
name = "Article"
table = "articles"
terms = [{ field = "title", prefix = "S", weight = 2 }]
values = [{ field = "published_on", slot = 0, kind = "date" }, { field = "author", slot = 1 }]
texts = ["body"]
include_if = "visible"
eager_load = ["comments"]
associations = [{ name = "comments", record_type = "Comment", table = "comments", foreign_key = "article_id" }]

[[record_type]]
name = "Comment"
table = "comments"
texts = ["body"]
"#;

    #[test]
    fn record_types_become_schemas_and_table_mappings() {
        let config = SearchConfig::from_toml_str(SAMPLE).unwrap();
        let registry = config.schema_registry().unwrap();
        let article = registry.get("Article").unwrap();
        assert_eq!(article.fields.len(), 4);
        assert_eq!(
            article.fields[0],
            FieldDescriptor::Term {
                field: "title".into(),
                prefix: "S".into(),
                weight: 2
            }
        );
        assert!(matches!(
            article.fields[2],
            FieldDescriptor::Value {
                kind: ValueKind::String,
                ..
            }
        ));
        assert_eq!(article.include_if.as_deref(), Some("visible"));
        assert_eq!(article.eager_load, vec!["comments".to_string()]);

        let tables = config.table_mappings();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].primary_key, "id");
        assert_eq!(tables[0].associations[0].foreign_key, "article_id");
    }

    #[test]
    fn paths_default_under_the_data_dir() {
        let mut config = SearchConfig::from_toml_str(SAMPLE).unwrap();
        config.data_dir = Some(PathBuf::from("/srv/search"));
        assert_eq!(config.index_path(), PathBuf::from("/srv/search/indexes/test"));
        assert_eq!(config.db_path(), PathBuf::from("/srv/search/records.db"));

        let index = config.index_config();
        assert_eq!(index.max_job_attempts, 3);
        assert_eq!(index.writer_heap_bytes, DEFAULT_WRITER_HEAP);
        assert_eq!(index.rebuild_batch_size, DEFAULT_REBUILD_BATCH);
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, SAMPLE).unwrap();
        let config = SearchConfig::load(Some(&path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.data_dir(), dir.path());
        assert_eq!(config.record_types.len(), 2);
    }

    #[test]
    fn malformed_config_is_reported() {
        assert!(SearchConfig::from_toml_str("record_type = 3").is_err());
    }

    #[test]
    fn duplicate_record_types_are_rejected() {
        let doubled = format!("{SAMPLE}\n[[record_type]]\nname = \"Comment\"\ntable = \"c2\"\n");
        let config = SearchConfig::from_toml_str(&doubled).unwrap();
        assert!(config.schema_registry().is_err());
    }
}
