//! Domain types shared by the index, the job queue and the record store.

pub mod types;
