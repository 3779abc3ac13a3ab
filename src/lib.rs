#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Hexstat - hex-grid statistics over monthly geospatial event archives
//!
//! Hexstat downloads monthly CSV archives, indexes every record into a
//! hexagonal grid and answers bounding-box queries with per-cell counts,
//! category histograms and risk-score statistics. It can be used as both a
//! command-line application and a library.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | `display` | Table formatting with `tabled` | `tabled` |
//! | `cli` | The `hexstat` binary | All above + `clap`, `indicatif`, `tracing-subscriber` |
//!
//! ```toml
//! # Library only
//! hexstat = { version = "0.3", default-features = false }
//!
//! # Default (CLI binary)
//! hexstat = "0.3"
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: SQLite storage
//!   - `core`: connection management and schema definitions
//!   - `hexstat`: records, ingestion runs and the aggregate generation counter
//!
//! - **[`lens`]**: business logic
//!   - `hex`: coordinate to cell indexing and cell boundaries
//!   - `archive`: resumable, checksum-verified archive downloads
//!   - `parse`: streaming CSV record parsing with deterministic identifiers
//!   - `ingest`: batch inserts and the single-period pipeline
//!   - `aggregate`: bounding-box aggregation, statistics and caching
//!   - `time`: periods, time-of-day windows and timestamp parsing
//!
//! - **[`config`]**: configuration management
//! - **[`error`]**: typed failures of the ingestion pipeline
//!
//! # Quick Start Examples
//!
//! ## Ingesting a month
//!
//! ```rust,ignore
//! use hexstat::{HexstatConfig, HexstatDatabase};
//! use hexstat::lens::ingest::IngestPipeline;
//!
//! let config = HexstatConfig::new(&None)?;
//! let db = HexstatDatabase::open(&config.sqlite_path())?;
//!
//! let run = IngestPipeline::new(&db, &config).ingest("2024-01", false)?;
//! println!("{}: {} ({} inserted)", run.month, run.status, run.counters.records_inserted);
//! ```
//!
//! ## Aggregating a bounding box
//!
//! ```rust,ignore
//! use hexstat::HexstatDatabase;
//! use hexstat::lens::aggregate::{AggregateQuery, AggregationEngine};
//!
//! let db = HexstatDatabase::open_in_dir("~/.hexstat")?;
//! let mut query = AggregateQuery::new("-0.2,51.4,0.0,51.6".parse()?, 7)?;
//! query.confidence_level = Some(0.95);
//!
//! for (cell, summary) in AggregationEngine::new(&db).summarize_by_bbox(&query)? {
//!     println!("{} {} {:?}", cell, summary.count, summary.statistics.mean_risk_score);
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod lens;

#[cfg(test)]
mod test_support;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{format_size, HexstatConfig};

// =============================================================================
// Errors
// =============================================================================

pub use error::{redact_paths, DownloadError, FailureKind, IndexingError, IngestError};

// =============================================================================
// Database Module - Re-export commonly used types
// =============================================================================

pub use database::HexstatDatabase;

pub use database::{DatabaseConn, SchemaDefinitions, SchemaManager, SchemaStatus, SCHEMA_VERSION};

pub use database::{
    IngestionRun, IngestionRunRepository, InsertableRecord, RecordFilter, RecordPoint,
    RecordRepository, RunCounters, RunStatus,
};

// =============================================================================
// Lens Module
// =============================================================================

pub use lens::utils::OutputFormat;
pub use tokio_util::sync::CancellationToken;

pub use lens::hex::{CellId, ChainedIndexer, H3Indexer, HexIndexer};

pub use lens::time::Period;
