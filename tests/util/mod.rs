use std::path::PathBuf;

use record_search::config::IndexConfig;
use record_search::schema::{RecordSchema, SchemaRegistry, ValueKind};
use record_search::search::query::SearchOptions;
use record_search::storage::{SqliteRecordStore, TableMapping};
use record_search::{DocKey, IndexRegistry, Record};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub const TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY,
    title TEXT,
    author TEXT,
    body TEXT,
    category TEXT,
    published_on TEXT,
    score REAL,
    visible INTEGER
);
CREATE TABLE IF NOT EXISTS comments (id INTEGER PRIMARY KEY, article_id INTEGER, body TEXT);
CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT, bio TEXT);
";

#[allow(dead_code)]
pub fn schemas() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            RecordSchema::new("Article")
                .term("title", "S", 2)
                .term("author", "A", 1)
                .value("published_on", 0, ValueKind::Date)
                .value("category", 1, ValueKind::String)
                .value("score", 2, ValueKind::Number)
                .text("body")
                .include_if("visible")
                .eager_load("comments"),
        )
        .unwrap();
    registry
        .register(
            RecordSchema::new("Comment")
                .value("article_id", 3, ValueKind::Number)
                .text("body"),
        )
        .unwrap();
    registry
        .register(RecordSchema::new("User").term("name", "N", 1).text("bio"))
        .unwrap();
    registry
}

#[allow(dead_code)]
pub fn tables() -> Vec<TableMapping> {
    vec![
        TableMapping::new("Article", "articles").has_many(
            "comments",
            "Comment",
            "comments",
            "article_id",
        ),
        TableMapping::new("Comment", "comments"),
        TableMapping::new("User", "users"),
    ]
}

#[allow(dead_code)]
pub fn article(id: i64, title: &str, body: &str) -> Record {
    Record::new("Article", id)
        .with("title", title)
        .with("author", "ada")
        .with("body", body)
        .with("category", "general")
        .with("published_on", "2021-01-01")
        .with("score", 1.0)
        .with("visible", true)
}

/// A temp directory holding one database (records and jobs) and one index,
/// plus a context and record store over them.
#[allow(dead_code)]
pub struct Fixture {
    pub registry: IndexRegistry,
    pub records: SqliteRecordStore,
    pub dir: TempDir,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(adjust: impl FnOnce(IndexConfig) -> IndexConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let config = adjust(IndexConfig::new(dir.path().join("indexes").join("test")));
        let registry = IndexRegistry::open(config, schemas(), &dir.path().join("records.db")).unwrap();
        let records = SqliteRecordStore::open(&dir.path().join("records.db"), tables()).unwrap();
        records.raw().execute_batch(TABLES_SQL).unwrap();
        Self {
            registry,
            records,
            dir,
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.registry.config().index_path.clone()
    }

    /// Another context over the same index and database.
    pub fn second_registry(&self) -> IndexRegistry {
        IndexRegistry::open(
            self.registry.config().clone(),
            schemas(),
            &self.dir.path().join("records.db"),
        )
        .unwrap()
    }

    /// Persist `record` and queue it for indexing.
    pub fn save(&mut self, record: Record) {
        self.records.upsert(&record).unwrap();
        self.registry
            .enqueue_update(&record.record_type, record.id)
            .unwrap();
    }

    pub fn remove(&mut self, record_type: &str, id: i64) {
        self.records.delete(record_type, id).unwrap();
        self.registry.enqueue_destroy(record_type, id).unwrap();
    }

    pub fn drain(&mut self) {
        self.registry.drain(&self.records, false, false).unwrap();
    }

    pub fn keys(&mut self, record_types: &[&str], query: &str) -> Vec<DocKey> {
        self.keys_with(record_types, query, SearchOptions::default())
    }

    pub fn keys_with(&mut self, record_types: &[&str], query: &str, options: SearchOptions) -> Vec<DocKey> {
        let mut search = self
            .registry
            .search(&self.records, record_types, query, options)
            .unwrap();
        let keys = search
            .results()
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect();
        keys
    }
}

#[allow(dead_code)]
pub fn key(record_type: &str, id: i64) -> DocKey {
    DocKey::new(record_type, id)
}
