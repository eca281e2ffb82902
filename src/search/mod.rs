//! Read side of the index.
//!
//! - **[`tantivy`]**: fixed engine schema, analysis and document encoding.
//! - **[`query_parser`]**: query-string grammar compiled against a [`crate::schema::FieldMap`].
//! - **[`readable`]**: cached read sessions with stale-snapshot retry.
//! - **[`query`]**: plain and similarity searches, ranking and result materialization.

pub mod query;
pub mod query_parser;
pub mod readable;
pub mod tantivy;
