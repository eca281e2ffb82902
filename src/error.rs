//! Error kinds surfaced by the indexing pipeline and the query layer.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The index is missing, the configured location is unusable, or a
    /// setting cannot be honoured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two record types disagree about a prefix code or a value slot.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("record type `{0}` has no registered search schema")]
    UnknownRecordType(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("cannot coerce field `{field}` to {expected}")]
    Coercion {
        field: String,
        expected: &'static str,
    },

    /// The index changed underneath a read and the retry failed as well.
    #[error("index changed during read and could not be reopened: {0}")]
    StaleIndex(#[source] tantivy::TantivyError),

    #[error("failed to apply index job {job_id}: {source}")]
    JobProcessing {
        job_id: i64,
        #[source]
        source: Box<Error>,
    },

    /// A leftover rebuild directory does not look like an index, so it is
    /// never deleted.
    #[error("refusing to remove {}: not a search index directory", path.display())]
    RebuildPathConflict { path: PathBuf },

    #[error("cannot open writable index at {}: {reason}", path.display())]
    WriterConflict { path: PathBuf, reason: String },

    #[error(transparent)]
    Tantivy(#[from] tantivy::TantivyError),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Engine errors that indicate the on-disk snapshot moved while a
    /// searcher was reading it.
    pub fn is_stale_read(&self) -> bool {
        matches!(self, Error::Tantivy(err) if is_stale_tantivy(err))
    }
}

pub(crate) fn is_stale_tantivy(err: &tantivy::TantivyError) -> bool {
    use tantivy::TantivyError;
    matches!(
        err,
        TantivyError::OpenReadError(_)
            | TantivyError::OpenDirectoryError(_)
            | TantivyError::IoError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_inside_the_engine_count_as_stale() {
        let err = Error::from(tantivy::TantivyError::from(std::io::Error::other(
            "segment file vanished",
        )));
        assert!(err.is_stale_read());
    }

    #[test]
    fn relational_errors_are_not_stale() {
        let err = Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_stale_read());
        assert!(!Error::InvalidQuery("x".into()).is_stale_read());
    }

    #[test]
    fn job_errors_name_the_job() {
        let err = Error::JobProcessing {
            job_id: 7,
            source: Box::new(Error::UnknownRecordType("Widget".into())),
        };
        let text = err.to_string();
        assert!(text.contains("job 7"));
        assert!(text.contains("Widget"));
    }
}
