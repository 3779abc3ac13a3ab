//! Database module
//!
//! This module provides all database functionality for hexstat, organized into:
//!
//! - **core**: Core database infrastructure (SQLite connections, schema management)
//! - **hexstat**: The persistent record store and ingestion run audit log
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── connection  # SQLite DatabaseConn wrapper
//! │   └── schema      # SQLite schema definitions and management
//! │
//! └── hexstat/        # Persistent storage
//!     ├── records     # Append-only geospatial records
//!     └── runs        # Ingestion run audit rows
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hexstat::database::HexstatDatabase;
//!
//! let db = HexstatDatabase::open_in_dir("~/.hexstat")?;
//! let generation = db.aggregate_generation()?;
//! let runs = db.runs().recent(10)?;
//! ```

pub mod core;
pub mod hexstat;

// SQLite connection and schema management
pub use core::{DatabaseConn, SchemaDefinitions, SchemaManager, SchemaStatus, SCHEMA_VERSION};

// Hexstat database (main entry point)
pub use hexstat::{ensure_data_dir, format_timestamp, parse_timestamp, HexstatDatabase};

// Repositories
pub use hexstat::{
    IngestionRun, IngestionRunRepository, InsertableRecord, RecordFilter, RecordPoint,
    RecordRepository, RunCounters, RunStatus, AGGREGATE_GENERATION_KEY,
};
