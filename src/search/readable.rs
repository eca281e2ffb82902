//! Read sessions over the active index, one per distinct set of record types.

use std::path::{Path, PathBuf};

use tantivy::{IndexReader, ReloadPolicy, Searcher};
use tracing::{debug, warn};

use crate::error::{Error, Result, is_stale_tantivy};
use crate::schema::FieldMap;
use crate::search::tantivy::{Analyzer, Fields, fields_from_schema, open_existing};

/// Cache key for a set of record types: sorted names joined by `---`.
pub fn model_set_key<S: AsRef<str>>(record_types: &[S]) -> String {
    let mut names: Vec<&str> = record_types.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();
    names.dedup();
    names.join("---")
}

pub struct ReadableIndex {
    path: PathBuf,
    reader: IndexReader,
    searcher: Searcher,
    fields: Fields,
    map: FieldMap,
    analyzer: Analyzer,
}

impl ReadableIndex {
    pub fn open(path: &Path, map: FieldMap) -> Result<Self> {
        let (reader, fields) = open_reader(path)?;
        let searcher = reader.searcher();
        debug!(
            path = %path.display(),
            record_types = ?map.record_types,
            num_docs = searcher.num_docs(),
            "opened readable index"
        );
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            searcher,
            fields,
            map,
            analyzer: Analyzer::new(),
        })
    }

    /// Pick up the latest committed state, including a directory swapped in
    /// by a rebuild.
    pub fn reopen(&mut self) -> Result<()> {
        let (reader, fields) = open_reader(&self.path)?;
        self.searcher = reader.searcher();
        self.reader = reader;
        self.fields = fields;
        Ok(())
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.map
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Split borrow used while compiling queries.
    pub fn parts(&mut self) -> (&Searcher, &Fields, &FieldMap, &mut Analyzer) {
        (&self.searcher, &self.fields, &self.map, &mut self.analyzer)
    }

    /// Run `op` against the current snapshot. If the snapshot went stale
    /// underneath it, reopen once and try again; a second stale failure is
    /// reported as [`Error::StaleIndex`].
    pub fn with_retry<T>(&mut self, mut op: impl FnMut(&Searcher, &Fields) -> Result<T>) -> Result<T> {
        match op(&self.searcher, &self.fields) {
            Err(err) if err.is_stale_read() => {
                warn!(path = %self.path.display(), error = %err, "index changed during read; reopening");
                self.reopen()?;
                match op(&self.searcher, &self.fields) {
                    Err(Error::Tantivy(inner)) if is_stale_tantivy(&inner) => {
                        Err(Error::StaleIndex(inner))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

fn open_reader(path: &Path) -> Result<(IndexReader, Fields)> {
    let index = open_existing(path)?;
    let fields = fields_from_schema(&index.schema())?;
    let reader = index
        .reader_builder()
        .reload_policy(ReloadPolicy::Manual)
        .try_into()?;
    Ok((reader, fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tantivy::open_or_create;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn stale() -> Error {
        Error::from(tantivy::TantivyError::from(std::io::Error::other(
            "file vanished",
        )))
    }

    fn index_in(dir: &TempDir) -> Result<ReadableIndex> {
        let path = dir.path().join("idx");
        open_or_create(&path)?;
        ReadableIndex::open(&path, FieldMap::default())
    }

    #[test]
    fn model_set_keys_ignore_order_and_duplicates() {
        assert_eq!(model_set_key(&["User", "Article", "User"]), "Article---User");
    }

    #[test]
    fn opening_a_missing_index_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = ReadableIndex::open(&dir.path().join("nope"), FieldMap::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn a_single_stale_read_is_retried_after_reopening() -> Result<()> {
        let dir = TempDir::new()?;
        let mut index = index_in(&dir)?;
        let calls = Cell::new(0);
        let value = index.with_retry(|_, _| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 { Err(stale()) } else { Ok(42) }
        })?;
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 2);
        Ok(())
    }

    #[test]
    fn a_second_stale_read_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let mut index = index_in(&dir)?;
        let calls = Cell::new(0);
        let result: Result<()> = index.with_retry(|_, _| {
            calls.set(calls.get() + 1);
            Err(stale())
        });
        assert!(matches!(result, Err(Error::StaleIndex(_))));
        assert_eq!(calls.get(), 2);
        Ok(())
    }

    #[test]
    fn other_errors_are_not_retried() -> Result<()> {
        let dir = TempDir::new()?;
        let mut index = index_in(&dir)?;
        let calls = Cell::new(0);
        let result: Result<()> = index.with_retry(|_, _| {
            calls.set(calls.get() + 1);
            Err(Error::InvalidQuery("bad".into()))
        });
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
        assert_eq!(calls.get(), 1);
        Ok(())
    }
}
