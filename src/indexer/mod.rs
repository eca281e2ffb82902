//! The write side: the single writable index, job draining and the
//! build-then-swap rebuild.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tantivy::{Index, IndexWriter, TantivyDocument, TantivyError};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::types::{DocKey, Job, JobAction, Record};
use crate::schema::{RecordSchema, SchemaRegistry};
use crate::search::tantivy::{
    Analyzer, Fields, encode_record, fields_from_schema, is_index_dir, key_term, open_or_create,
    suffixed,
};
use crate::storage::{FindOptions, RecordStore, SqliteStorage};

/// Smallest per-thread heap tantivy accepts for a writer.
const MIN_WRITER_HEAP: usize = 15_000_000;

pub const REBUILD_SUFFIX: &str = ".new";
pub const SWAP_SUFFIX: &str = ".tmp";

pub struct WriteableIndex {
    path: PathBuf,
    suffix: String,
    index: Index,
    writer: IndexWriter,
    fields: Fields,
    analyzer: Analyzer,
    uncommitted: usize,
}

impl WriteableIndex {
    /// Open (creating if needed) the index at `base + suffix` and take its
    /// writer lock. Another writer on the same directory is a
    /// [`Error::WriterConflict`].
    pub fn open(base: &Path, suffix: &str, heap_bytes: usize) -> Result<Self> {
        let path = suffixed(base, suffix);
        let index = open_or_create(&path)?;
        let fields = fields_from_schema(&index.schema())?;
        let writer = index
            .writer_with_num_threads(1, heap_bytes.max(MIN_WRITER_HEAP))
            .map_err(|e| match e {
                TantivyError::LockFailure(lock, detail) => Error::WriterConflict {
                    path: path.clone(),
                    reason: detail.unwrap_or_else(|| lock.to_string()),
                },
                other => Error::from(other),
            })?;
        info!(path = %path.display(), "opened writable index");
        Ok(Self {
            path,
            suffix: suffix.to_string(),
            index,
            writer,
            fields,
            analyzer: Analyzer::new(),
            uncommitted: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Replace the document for `record`, or remove it when the type's
    /// inclusion predicate rejects the record.
    pub fn index_record(&mut self, schema: &RecordSchema, record: &Record) -> Result<()> {
        if !schema.includes(record) {
            debug!(key = %record.key(), "record excluded by inclusion predicate");
            self.delete(&record.key());
            return Ok(());
        }
        let doc: TantivyDocument = encode_record(&self.fields, &mut self.analyzer, schema, record)?;
        self.writer.delete_term(key_term(&self.fields, &record.key()));
        self.writer.add_document(doc)?;
        self.uncommitted += 1;
        Ok(())
    }

    pub fn delete(&mut self, key: &DocKey) {
        self.writer.delete_term(key_term(&self.fields, key));
        self.uncommitted += 1;
    }

    /// Make pending changes durable and visible to newly opened readers.
    pub fn commit(&mut self) -> Result<()> {
        let started = Instant::now();
        let opstamp = self.writer.commit()?;
        debug!(
            path = %self.path.display(),
            opstamp,
            operations = self.uncommitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "committed index"
        );
        self.uncommitted = 0;
        Ok(())
    }

    /// Commit, wait for merges and release the writer lock.
    pub fn close(mut self) -> Result<()> {
        self.commit()?;
        self.writer.wait_merging_threads()?;
        info!(path = %self.path.display(), "closed writable index");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DrainOptions {
    /// Commit the index after every job, before the job row is released.
    pub flush: bool,
    pub verbose: bool,
    /// Attempts after which a failing job is quarantined; 0 never quarantines.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    /// Jobs another drain consumed or quarantined first.
    pub skipped: usize,
    /// Jobs sitting in quarantine when the drain finished.
    pub quarantined: usize,
}

/// Apply every runnable job, oldest first. Each job runs in its own
/// write-locking transaction; a failure rolls back that job only.
pub fn drain(
    jobs: &mut SqliteStorage,
    writer: &mut WriteableIndex,
    schemas: &SchemaRegistry,
    records: &dyn RecordStore,
    options: DrainOptions,
) -> Result<DrainReport> {
    let started = Instant::now();
    let mut report = DrainReport::default();

    let quarantined = jobs.quarantined_jobs(options.max_attempts)?;
    if !quarantined.is_empty() {
        warn!(
            count = quarantined.len(),
            job_ids = ?quarantined.iter().map(|j| j.id).collect::<Vec<_>>(),
            "skipping quarantined index jobs"
        );
    }
    report.quarantined = quarantined.len();

    for job_id in jobs.runnable_job_ids(options.max_attempts)? {
        let tx = jobs.begin_job()?;
        let Some(job) = tx.load(job_id)? else {
            debug!(job_id, "job already consumed by another drain");
            report.skipped += 1;
            continue;
        };
        if options.max_attempts > 0 && job.attempts >= options.max_attempts {
            report.skipped += 1;
            continue;
        }

        let outcome = apply_job(writer, schemas, records, &job)
            .and_then(|()| tx.complete(job.id))
            .and_then(|()| if options.flush { writer.commit() } else { Ok(()) })
            .and_then(|()| tx.commit());

        match outcome {
            Ok(()) => {
                report.applied += 1;
                if options.verbose {
                    info!(job_id, key = %job.key(), action = job.action.as_str(), "applied index job");
                } else {
                    debug!(job_id, key = %job.key(), action = job.action.as_str(), "applied index job");
                }
            }
            Err(source) => {
                report.failed += 1;
                let attempts = match jobs.record_failure(job.id, &source.to_string()) {
                    Ok(attempts) => attempts,
                    Err(bookkeeping) => {
                        warn!(job_id, error = %bookkeeping, "could not record index job failure");
                        job.attempts
                    }
                };
                let err = Error::JobProcessing {
                    job_id: job.id,
                    source: Box::new(source),
                };
                warn!(
                    job_id,
                    key = %job.key(),
                    attempts,
                    error = %err,
                    "index job failed; rolled back"
                );
                if options.max_attempts > 0 && attempts >= options.max_attempts {
                    warn!(job_id, attempts, "index job quarantined");
                    report.quarantined += 1;
                }
            }
        }
    }

    writer.commit()?;
    info!(
        applied = report.applied,
        failed = report.failed,
        skipped = report.skipped,
        quarantined = report.quarantined,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "drain complete"
    );
    Ok(report)
}

fn apply_job(
    writer: &mut WriteableIndex,
    schemas: &SchemaRegistry,
    records: &dyn RecordStore,
    job: &Job,
) -> Result<()> {
    match job.action {
        JobAction::Update => {
            let schema = schemas.get(&job.record_type)?;
            match records.find_one(&job.record_type, job.record_id)? {
                Some(record) => writer.index_record(schema, &record),
                None => {
                    debug!(job_id = job.id, key = %job.key(), "record vanished; destroying instead");
                    writer.delete(&job.key());
                    Ok(())
                }
            }
        }
        JobAction::Destroy => {
            writer.delete(&job.key());
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RebuildOptions {
    pub batch_size: usize,
    pub heap_bytes: usize,
    pub verbose: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            heap_bytes: 50_000_000,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub indexed: usize,
    /// Jobs at or below the watermark that the rebuild made redundant.
    pub purged: usize,
}

/// Build a fresh index for `record_types` next to `base`, swap it into
/// place, then purge the jobs it covers. The active index is left untouched
/// by any failure before the swap.
pub fn rebuild<S: AsRef<str>>(
    jobs: &SqliteStorage,
    schemas: &SchemaRegistry,
    records: &dyn RecordStore,
    base: &Path,
    record_types: &[S],
    options: RebuildOptions,
) -> Result<RebuildReport> {
    let started = Instant::now();
    let watermark = jobs.max_job_id()?;
    let new_path = suffixed(base, REBUILD_SUFFIX);
    let swap_path = suffixed(base, SWAP_SUFFIX);

    let schemas_to_build = record_types
        .iter()
        .map(|t| schemas.get(t.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    clear_leftover(&swap_path)?;
    clear_leftover(&new_path)?;
    info!(
        path = %base.display(),
        watermark = ?watermark,
        record_types = ?schemas_to_build.iter().map(|s| s.record_type.as_str()).collect::<Vec<_>>(),
        "rebuild started"
    );

    let mut writer = WriteableIndex::open(base, REBUILD_SUFFIX, options.heap_bytes)?;
    let mut report = RebuildReport::default();
    let batch_size = options.batch_size.max(1);
    for schema in schemas_to_build {
        let mut after = None;
        let mut indexed = 0usize;
        loop {
            let ids = records.ids_after(&schema.record_type, after, batch_size)?;
            let Some(&last) = ids.last() else {
                break;
            };
            for record in records.find(&schema.record_type, &ids, &FindOptions::default())? {
                writer.index_record(schema, &record)?;
                indexed += 1;
            }
            after = Some(last);
            if options.verbose {
                info!(record_type = %schema.record_type, through_id = last, indexed, "rebuild batch");
            } else {
                debug!(record_type = %schema.record_type, through_id = last, indexed, "rebuild batch");
            }
        }
        info!(record_type = %schema.record_type, indexed, "rebuilt record type");
        report.indexed += indexed;
    }
    writer.close()?;

    swap_into_place(base, &new_path, &swap_path)?;

    if let Some(watermark) = watermark {
        report.purged = jobs.purge_jobs_through(watermark)?;
    }
    info!(
        indexed = report.indexed,
        purged = report.purged,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rebuild complete"
    );
    Ok(report)
}

/// Remove a leftover index directory from an interrupted rebuild. Anything
/// that is not recognizably an index is left alone and reported.
fn clear_leftover(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if !is_index_dir(path) {
        return Err(Error::RebuildPathConflict {
            path: path.to_path_buf(),
        });
    }
    warn!(path = %path.display(), "removing leftover index directory");
    fs::remove_dir_all(path)?;
    Ok(())
}

fn swap_into_place(base: &Path, new_path: &Path, swap_path: &Path) -> Result<()> {
    clear_leftover(swap_path)?;
    let had_active = base.exists();
    if had_active {
        if !is_index_dir(base) {
            return Err(Error::RebuildPathConflict {
                path: base.to_path_buf(),
            });
        }
        fs::rename(base, swap_path)?;
    }
    if let Err(err) = fs::rename(new_path, base) {
        if had_active && let Err(restore) = fs::rename(swap_path, base) {
            warn!(error = %restore, path = %base.display(), "failed to restore previous index");
        }
        return Err(err.into());
    }
    clear_leftover(swap_path)?;
    info!(path = %base.display(), "swapped rebuilt index into place");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ValueKind;
    use crate::search::tantivy::FORMAT_MARKER;
    use crate::storage::{SqliteRecordStore, TableMapping};
    use rusqlite::Connection;
    use tantivy::collector::Count;
    use tantivy::query::TermQuery;
    use tantivy::schema::{IndexRecordOption, Term};
    use tempfile::TempDir;

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                RecordSchema::new("Article")
                    .term("title", "S", 1)
                    .value("published", 0, ValueKind::String)
                    .include_if("visible"),
            )
            .unwrap();
        registry
    }

    fn records() -> SqliteRecordStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE articles (id INTEGER PRIMARY KEY, title TEXT, published TEXT, visible INTEGER);",
        )
        .unwrap();
        SqliteRecordStore::from_connection(conn, [TableMapping::new("Article", "articles")])
    }

    fn article(id: i64, title: &str) -> Record {
        Record::new("Article", id)
            .with("title", title)
            .with("published", "yes")
            .with("visible", true)
    }

    fn count_word(path: &Path, word: &str) -> usize {
        let index = Index::open_in_dir(path).unwrap();
        let fields = fields_from_schema(&index.schema()).unwrap();
        let searcher = index.reader().unwrap().searcher();
        let query = TermQuery::new(
            Term::from_field_text(fields.body, word),
            IndexRecordOption::Basic,
        );
        searcher.search(&query, &Count).unwrap()
    }

    #[test]
    fn a_second_writer_on_the_same_directory_conflicts() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let first = WriteableIndex::open(&base, "", 0).unwrap();
        let err = WriteableIndex::open(&base, "", 0).err().unwrap();
        assert!(matches!(err, Error::WriterConflict { .. }));
        first.close().unwrap();
        WriteableIndex::open(&base, "", 0).unwrap().close().unwrap();
    }

    #[test]
    fn drain_applies_updates_and_destroys_in_order() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let mut jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        store.upsert(&article(1, "hello world")).unwrap();
        store.upsert(&article(2, "hello again")).unwrap();

        jobs.enqueue_update("Article", 1).unwrap();
        jobs.enqueue_update("Article", 2).unwrap();
        jobs.enqueue_destroy("Article", 2).unwrap();
        // A job for a record that no longer exists becomes a destroy.
        jobs.enqueue_update("Article", 3).unwrap();

        let mut writer = WriteableIndex::open(&base, "", 0).unwrap();
        let report = drain(&mut jobs, &mut writer, &schemas, &store, DrainOptions::default()).unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(report.failed, 0);
        assert!(jobs.jobs().unwrap().is_empty());
        assert_eq!(count_word(&base, "hello"), 1);
    }

    #[test]
    fn excluded_records_are_removed_from_the_index() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let mut jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        store.upsert(&article(1, "hidden gem")).unwrap();
        let mut writer = WriteableIndex::open(&base, "", 0).unwrap();

        jobs.enqueue_update("Article", 1).unwrap();
        drain(&mut jobs, &mut writer, &schemas, &store, DrainOptions::default()).unwrap();
        assert_eq!(count_word(&base, "gem"), 1);

        store.upsert(&article(1, "hidden gem").with("visible", false)).unwrap();
        jobs.enqueue_update("Article", 1).unwrap();
        drain(&mut jobs, &mut writer, &schemas, &store, DrainOptions::default()).unwrap();
        assert_eq!(count_word(&base, "gem"), 0);
    }

    #[test]
    fn failing_jobs_survive_and_are_quarantined() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let mut jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        jobs.enqueue_update("Unregistered", 1).unwrap();
        let mut writer = WriteableIndex::open(&base, "", 0).unwrap();
        let options = DrainOptions {
            max_attempts: 2,
            ..DrainOptions::default()
        };

        let first = drain(&mut jobs, &mut writer, &schemas, &store, options).unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.quarantined, 0);
        let second = drain(&mut jobs, &mut writer, &schemas, &store, options).unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.quarantined, 1);
        let third = drain(&mut jobs, &mut writer, &schemas, &store, options).unwrap();
        assert_eq!(third.failed, 0);
        assert_eq!(third.applied, 0);
        assert_eq!(third.quarantined, 1);

        let remaining = jobs.jobs().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 2);
        assert!(remaining[0].last_error.is_some());
    }

    #[test]
    fn unrecordable_failures_do_not_stop_the_drain() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let mut jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        jobs.enqueue_update("Unregistered", 1).unwrap();
        jobs.enqueue_update("Unregistered", 2).unwrap();
        jobs.raw()
            .execute_batch(
                "CREATE TRIGGER refuse_attempts BEFORE UPDATE OF attempts ON index_jobs
                 BEGIN SELECT RAISE(ABORT, 'bookkeeping unavailable'); END;",
            )
            .unwrap();
        let mut writer = WriteableIndex::open(&base, "", 0).unwrap();

        let report = drain(&mut jobs, &mut writer, &schemas, &store, DrainOptions::default()).unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.applied, 0);
        let remaining = jobs.jobs().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|job| job.attempts == 0));
    }

    #[test]
    fn rebuild_swaps_in_a_fresh_index_and_purges_through_the_watermark() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let mut jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        for id in 1..=5 {
            store.upsert(&article(id, &format!("entry number{id}"))).unwrap();
        }
        jobs.enqueue_update("Article", 1).unwrap();
        WriteableIndex::open(&base, "", 0).unwrap().close().unwrap();

        let options = RebuildOptions {
            batch_size: 2,
            ..RebuildOptions::default()
        };
        let report = rebuild(&jobs, &schemas, &store, &base, &["Article"], options).unwrap();
        assert_eq!(report.indexed, 5);
        assert_eq!(report.purged, 1);
        assert_eq!(count_word(&base, "entry"), 5);
        assert!(!suffixed(&base, REBUILD_SUFFIX).exists());
        assert!(!suffixed(&base, SWAP_SUFFIX).exists());
    }

    #[test]
    fn a_failed_swap_restores_the_previous_index() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        WriteableIndex::open(&base, "", 0).unwrap().close().unwrap();
        let missing = suffixed(&base, REBUILD_SUFFIX);
        let swap = suffixed(&base, SWAP_SUFFIX);

        assert!(swap_into_place(&base, &missing, &swap).is_err());
        assert!(base.join(FORMAT_MARKER).exists());
        assert!(!swap.exists());
        assert!(!missing.exists());
    }

    #[test]
    fn unrecognized_leftovers_abort_the_rebuild_without_deleting_anything() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("idx");
        let jobs = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        let store = records();
        let schemas = schemas();
        WriteableIndex::open(&base, "", 0).unwrap().close().unwrap();

        let stray = suffixed(&base, REBUILD_SUFFIX);
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("notes.txt"), "keep me").unwrap();

        let err = rebuild(&jobs, &schemas, &store, &base, &["Article"], RebuildOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::RebuildPathConflict { .. }));
        assert!(stray.join("notes.txt").exists());
        assert!(base.join(FORMAT_MARKER).exists());
    }
}
