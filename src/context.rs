//! The owned context the hosting application creates once and passes to
//! every indexing and query call: schema registry, job storage, the single
//! writer handle and the per-type-set reader cache.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tantivy::query::Query;
use tantivy::schema::Term;
use tracing::info;

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::indexer::{self, DrainOptions, DrainReport, RebuildOptions, RebuildReport, WriteableIndex};
use crate::model::types::{DocKey, FieldValue, Indexed};
use crate::schema::{FieldMap, SchemaRegistry, ValueKind};
use crate::search::query::{Search, SearchOptions, Similar};
use crate::search::query_parser::term_query;
use crate::search::readable::{ReadableIndex, model_set_key};
use crate::search::tantivy::{Fields, slot_term};
use crate::storage::{RecordStore, SqliteStorage};

/// The child side of a one-to-many relation: records of `record_type`
/// whose `foreign_key` field holds the owner's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub record_type: String,
    pub foreign_key: String,
}

impl RelationDescriptor {
    pub fn new(record_type: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            foreign_key: foreign_key.into(),
        }
    }
}

pub struct IndexRegistry {
    config: IndexConfig,
    schemas: SchemaRegistry,
    jobs: SqliteStorage,
    writer: Option<WriteableIndex>,
    readers: HashMap<String, ReadableIndex>,
}

impl IndexRegistry {
    pub fn new(config: IndexConfig, schemas: SchemaRegistry, jobs: SqliteStorage) -> Self {
        Self {
            config,
            schemas,
            jobs,
            writer: None,
            readers: HashMap::new(),
        }
    }

    /// Open the job database at `jobs_db` and build a context around it.
    pub fn open(config: IndexConfig, schemas: SchemaRegistry, jobs_db: &Path) -> Result<Self> {
        let jobs = SqliteStorage::open(jobs_db)?;
        Ok(Self::new(config, schemas, jobs))
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn jobs(&self) -> &SqliteStorage {
        &self.jobs
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    /// Open the writer at `index_path + suffix`. Reopening the same suffix is
    /// a no-op; a different suffix while one is open is a conflict.
    pub fn open_writer(&mut self, suffix: &str) -> Result<&mut WriteableIndex> {
        ensure_writer(&mut self.writer, &self.config, suffix)
    }

    pub fn close_writer(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }

    pub fn enqueue_update(&mut self, record_type: &str, record_id: i64) -> Result<i64> {
        self.schemas.get(record_type)?;
        self.jobs.enqueue_update(record_type, record_id)
    }

    pub fn enqueue_destroy(&mut self, record_type: &str, record_id: i64) -> Result<i64> {
        self.schemas.get(record_type)?;
        self.jobs.enqueue_destroy(record_type, record_id)
    }

    /// Apply queued jobs to the index. A no-op when the queue is empty.
    pub fn drain(&mut self, records: &dyn RecordStore, flush: bool, verbose: bool) -> Result<DrainReport> {
        let pending = self.jobs.pending_record_types()?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }
        if verbose {
            info!(record_types = ?pending, "draining index jobs");
        }
        let writer = ensure_writer(&mut self.writer, &self.config, "")?;
        let options = DrainOptions {
            flush,
            verbose,
            max_attempts: self.config.max_job_attempts,
        };
        indexer::drain(&mut self.jobs, writer, &self.schemas, records, options)
    }

    /// Rebuild the index for `record_types` (every registered type when
    /// empty) and swap it into place. Refused while this context holds the
    /// writer.
    pub fn rebuild<S: AsRef<str>>(
        &mut self,
        records: &dyn RecordStore,
        record_types: &[S],
        verbose: bool,
    ) -> Result<RebuildReport> {
        if let Some(writer) = &self.writer {
            return Err(Error::WriterConflict {
                path: writer.path().to_path_buf(),
                reason: "a writer is open; close it before rebuilding".into(),
            });
        }
        let types: Vec<String> = if record_types.is_empty() {
            self.schemas.record_types().map(str::to_string).collect()
        } else {
            record_types.iter().map(|t| t.as_ref().to_string()).collect()
        };
        let options = RebuildOptions {
            batch_size: self.config.rebuild_batch_size,
            heap_bytes: self.config.writer_heap_bytes,
            verbose,
        };
        indexer::rebuild(
            &self.jobs,
            &self.schemas,
            records,
            &self.config.index_path,
            types.as_slice(),
            options,
        )
    }

    /// The reader for exactly this set of record types: reopened in place
    /// when cached, otherwise validated, opened and cached.
    pub fn readable<S: AsRef<str>>(&mut self, record_types: &[S]) -> Result<&mut ReadableIndex> {
        match self.readers.entry(model_set_key(record_types)) {
            Entry::Occupied(entry) => {
                let reader = entry.into_mut();
                reader.reopen()?;
                Ok(reader)
            }
            Entry::Vacant(entry) => {
                let map = self.schemas.validate(record_types)?;
                let reader = ReadableIndex::open(&self.config.index_path, map)?;
                Ok(entry.insert(reader))
            }
        }
    }

    fn eager_load<S: AsRef<str>>(&self, record_types: &[S]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut eager = BTreeMap::new();
        for record_type in record_types {
            let schema = self.schemas.get(record_type.as_ref())?;
            if !schema.eager_load.is_empty() {
                eager.insert(schema.record_type.clone(), schema.eager_load.clone());
            }
        }
        Ok(eager)
    }

    pub fn search<'a, S: AsRef<str>>(
        &'a mut self,
        records: &'a dyn RecordStore,
        record_types: &[S],
        query_string: &str,
        options: SearchOptions,
    ) -> Result<Search<'a>> {
        let eager = self.eager_load(record_types)?;
        let reader = self.readable(record_types)?;
        Search::new(reader, records, record_types, query_string, options, eager, None)
    }

    pub fn similar<'a, S: AsRef<str>>(
        &'a mut self,
        records: &'a dyn RecordStore,
        record_types: &[S],
        seeds: &[DocKey],
        options: SearchOptions,
    ) -> Result<Similar<'a>> {
        let eager = self.eager_load(record_types)?;
        let reader = self.readable(record_types)?;
        Similar::new(reader, records, record_types, seeds.to_vec(), options, eager)
    }

    /// Search among the records that belong to `owner_id` through
    /// `relation`. The foreign key must be indexed as a term or value field
    /// of the child type.
    pub fn scoped_search<'a>(
        &'a mut self,
        records: &'a dyn RecordStore,
        owner_id: i64,
        relation: &RelationDescriptor,
        query_string: &str,
        options: SearchOptions,
    ) -> Result<Search<'a>> {
        let record_types = [relation.record_type.as_str()];
        let eager = self.eager_load(&record_types)?;
        let reader = self.readable(&record_types)?;
        let filter = owner_filter(reader.fields(), reader.field_map(), relation, owner_id)?;
        Search::new(
            reader,
            records,
            &record_types,
            query_string,
            options,
            eager,
            Some(filter),
        )
    }

    /// Commit and release the writer.
    pub fn close(mut self) -> Result<()> {
        self.close_writer()
    }
}

/// Similarity search seeded by `seeds`, over the distinct record types of
/// the seeds. Use [`IndexRegistry::similar`] to choose the types.
pub fn search_similar<'a, R: Indexed>(
    registry: &'a mut IndexRegistry,
    records: &'a dyn RecordStore,
    seeds: &[R],
    options: SearchOptions,
) -> Result<Similar<'a>> {
    let keys: Vec<DocKey> = seeds.iter().map(Indexed::doc_key).collect();
    let mut record_types: Vec<String> = keys.iter().map(|k| k.record_type.clone()).collect();
    record_types.sort_unstable();
    record_types.dedup();
    registry.similar(records, record_types.as_slice(), &keys, options)
}

fn ensure_writer<'w>(
    slot: &'w mut Option<WriteableIndex>,
    config: &IndexConfig,
    suffix: &str,
) -> Result<&'w mut WriteableIndex> {
    if let Some(open) = slot.as_ref()
        && open.suffix() != suffix
    {
        return Err(Error::WriterConflict {
            path: open.path().to_path_buf(),
            reason: format!("writer already open with suffix `{}`", open.suffix()),
        });
    }
    match slot {
        Some(writer) => Ok(writer),
        None => {
            let writer = WriteableIndex::open(&config.index_path, suffix, config.writer_heap_bytes)?;
            Ok(slot.insert(writer))
        }
    }
}

fn owner_filter(
    fields: &Fields,
    map: &FieldMap,
    relation: &RelationDescriptor,
    owner_id: i64,
) -> Result<Box<dyn Query>> {
    let key = &relation.foreign_key;
    if let Some(code) = map.prefix_for(key) {
        let term = Term::from_field_text(fields.prefixed, &format!("{code}:{owner_id}"));
        return Ok(term_query(term));
    }
    if let Some(slot) = map.slot_for(key) {
        let kind = map.kind_for_slot(slot).unwrap_or(ValueKind::String);
        let encoded = kind.encode(key, &FieldValue::Integer(owner_id))?;
        let term = Term::from_field_text(fields.slots, &slot_term(slot, &encoded));
        return Ok(term_query(term));
    }
    Err(Error::InvalidQuery(format!(
        "`{key}` is not indexed as a term or value field of `{}`",
        relation.record_type
    )))
}
