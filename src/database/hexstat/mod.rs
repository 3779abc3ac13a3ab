//! Hexstat database storage
//!
//! The persistent database shared by ingestion workers and aggregation
//! readers. It stores:
//! - Records (append-only, keyed by deterministic identifier)
//! - Ingestion run audit rows
//! - The aggregate generation counter in `hexstat_meta`

mod records;
mod runs;

pub use records::{
    InsertableRecord, RecordFilter, RecordPoint, RecordRepository, AGGREGATE_GENERATION_KEY,
};
pub use runs::{IngestionRun, IngestionRunRepository, RunCounters, RunStatus};

use crate::database::core::{DatabaseConn, SchemaManager, SchemaStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::{info, warn};

/// Main hexstat database (SQLite backend)
///
/// Each worker opens its own handle; SQLite in WAL mode serialises the
/// writers and lets aggregation readers proceed concurrently.
pub struct HexstatDatabase {
    db: DatabaseConn,
}

impl HexstatDatabase {
    /// Open the database at the specified path
    ///
    /// A fresh file is initialised. An older schema or a database with
    /// missing tables is upgraded in place without dropping records. A
    /// database written by a newer version is refused.
    pub fn open(path: &str) -> Result<Self> {
        let db = DatabaseConn::open_path(path)?;
        let schema = SchemaManager::new(&db.conn);

        match schema.check_status()? {
            SchemaStatus::Current => {
                info!("Hexstat database schema is current");
            }
            SchemaStatus::NotInitialized => {
                info!("Initializing hexstat database schema");
                schema.initialize()?;
            }
            SchemaStatus::NeedsMigration { from, to } => {
                info!("Upgrading hexstat database schema from v{} to v{}", from, to);
                schema.initialize()?;
            }
            SchemaStatus::Corrupted => {
                warn!("Hexstat database is missing tables, recreating them");
                schema.initialize()?;
            }
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => {
                return Err(anyhow!(
                    "Database schema v{} is newer than supported v{}",
                    database_version,
                    required_version
                ));
            }
        }

        Ok(Self { db })
    }

    /// Open the database from a data directory
    ///
    /// Creates the standard database file path: `{data_dir}/hexstat-data.sqlite3`
    pub fn open_in_dir(data_dir: &str) -> Result<Self> {
        ensure_data_dir(data_dir)?;
        let path = format!("{}/hexstat-data.sqlite3", data_dir.trim_end_matches('/'));
        Self::open(&path)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = DatabaseConn::open_in_memory()?;
        let schema = SchemaManager::new(&db.conn);
        schema.initialize()?;
        Ok(Self { db })
    }

    pub fn records(&self) -> RecordRepository<'_> {
        RecordRepository::new(&self.db.conn)
    }

    pub fn runs(&self) -> IngestionRunRepository<'_> {
        IngestionRunRepository::new(&self.db.conn)
    }

    /// Get the underlying database connection (for advanced queries)
    pub fn connection(&self) -> &rusqlite::Connection {
        &self.db.conn
    }

    /// Current aggregate generation, bumped by every batch that adds records
    pub fn aggregate_generation(&self) -> Result<u64> {
        self.records().aggregate_generation()
    }

    /// Get metadata value from the database
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let schema = SchemaManager::new(&self.db.conn);
        schema.get_meta(key)
    }

    /// Set metadata value in the database
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let schema = SchemaManager::new(&self.db.conn);
        schema.set_meta(key, value)
    }
}

/// Ensure the data directory exists
pub fn ensure_data_dir(data_dir: &str) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow!("Failed to create data directory '{}': {}", data_dir, e))
}

/// Format a timestamp as fixed-width `YYYY-MM-DDTHH:MM:SSZ`
///
/// Sub-second precision is dropped so that text order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp written by [`format_timestamp`]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
