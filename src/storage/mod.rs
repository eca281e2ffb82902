//! Persistence: the durable job queue and the relational record source.

pub mod records;
pub mod sqlite;

pub use records::{AssociationMapping, FindOptions, RecordStore, SqliteRecordStore, TableMapping};
pub use sqlite::{JobTransaction, SqliteStorage};
