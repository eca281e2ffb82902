pub mod config;
pub mod context;
pub mod error;
pub mod indexer;
pub mod model;
pub mod schema;
pub mod search;
pub mod storage;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

pub use config::{IndexConfig, SearchConfig};
pub use context::{IndexRegistry, RelationDescriptor, search_similar};
pub use error::Error;
pub use model::types::{DocKey, FieldValue, Indexed, Record};
pub use schema::{RecordSchema, SchemaRegistry, ValueKind};
pub use search::query::{SearchOptions, SearchResult};
pub use storage::{FindOptions, RecordStore, SqliteRecordStore, TableMapping};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "rsearch",
    version,
    about = "Maintain and query the record search index"
)]
pub struct Cli {
    /// Path to search.toml (defaults to <data-dir>/search.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override data dir (index + db). Defaults to platform data dir.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a record for (re)indexing or removal
    Enqueue {
        #[arg(long = "type")]
        record_type: String,
        #[arg(long)]
        id: i64,
        /// Queue a removal instead of an update
        #[arg(long)]
        destroy: bool,
    },
    /// Apply queued index jobs
    Drain {
        /// Commit the index after every job
        #[arg(long)]
        flush: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Rebuild the index from the record tables and swap it into place
    Rebuild {
        /// Record types to include (all configured types when omitted)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long)]
        verbose: bool,
    },
    /// Run a query and print one JSON result per line
    Search {
        #[arg(long, value_delimiter = ',', required = true)]
        types: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Value field to sort by
        #[arg(long)]
        sort_by: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Value field to collapse on
        #[arg(long)]
        collapse_by: Option<String>,
        query: String,
    },
    /// Find records similar to the given `Type-id` keys
    Similar {
        /// Record types to search (the seeds' types when omitted)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(required = true)]
        keys: Vec<DocKey>,
    },
    /// List queued jobs, quarantined ones included
    Jobs {
        /// Give quarantined jobs a fresh set of attempts
        #[arg(long)]
        requeue: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = SearchConfig::load(cli.config.as_deref(), cli.data_dir.clone())?;
    let db_path = config.db_path();
    let schemas = config.schema_registry()?;
    let mut registry = IndexRegistry::open(config.index_config(), schemas, &db_path)
        .with_context(|| format!("opening job queue at {}", db_path.display()))?;
    let records = SqliteRecordStore::open(&db_path, config.table_mappings())
        .with_context(|| format!("opening record database at {}", db_path.display()))?;

    match cli.command {
        Commands::Enqueue {
            record_type,
            id,
            destroy,
        } => {
            let job_id = if destroy {
                registry.enqueue_destroy(&record_type, id)?
            } else {
                registry.enqueue_update(&record_type, id)?
            };
            print_json(&serde_json::json!({ "job_id": job_id }))?;
        }
        Commands::Drain { flush, verbose } => {
            let report = registry.drain(&records, flush, verbose)?;
            print_json(&report)?;
        }
        Commands::Rebuild { types, verbose } => {
            let report = registry.rebuild(&records, types.as_slice(), verbose)?;
            print_json(&report)?;
        }
        Commands::Search {
            types,
            limit,
            offset,
            sort_by,
            desc,
            collapse_by,
            query,
        } => {
            let mut options = SearchOptions::new().offset(offset);
            options.limit = limit;
            if let Some(field) = sort_by {
                options = options.sort_by(field, !desc);
            }
            if let Some(field) = collapse_by {
                options = options.collapse_by(field);
            }
            let mut search = registry.search(&records, types.as_slice(), &query, options)?;
            if let Some(corrected) = search.spelling_correction() {
                tracing::info!(corrected, "did you mean");
            }
            let estimated = search.matches_estimated()?;
            tracing::info!(estimated, description = %search.log_description(), "search finished");
            for result in search.results()? {
                print_json(result)?;
            }
        }
        Commands::Similar { types, limit, keys } => {
            let mut options = SearchOptions::new();
            options.limit = limit;
            let mut similar = if types.is_empty() {
                search_similar(&mut registry, &records, keys.as_slice(), options)?
            } else {
                registry.similar(&records, types.as_slice(), &keys, options)?
            };
            for result in similar.results()? {
                print_json(result)?;
            }
        }
        Commands::Jobs { requeue } => {
            if requeue {
                let count = registry.jobs().requeue_quarantined()?;
                tracing::info!(count, "requeued quarantined jobs");
            }
            for job in registry.jobs().jobs()? {
                print_json(&job)?;
            }
        }
    }
    registry.close()?;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "record-search", "record-search").map_or_else(
        || PathBuf::from(".record-search"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
