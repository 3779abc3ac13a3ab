//! Database schema management
//!
//! All tables are defined here so that the record store, the run audit log
//! and the aggregate generation counter stay consistent with each other.

use anyhow::{anyhow, Result};
use rusqlite::Connection;

/// Current schema version
/// Increment this when making schema changes
pub const SCHEMA_VERSION: u32 = 3;

/// Schema definitions for all tables in the shared database
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    /// SQL for creating the meta table (schema version, aggregate generation)
    pub const META_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS hexstat_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
    "#;

    /// SQL for creating the records table
    ///
    /// Timestamps are fixed-width UTC RFC 3339 strings so that text ordering
    /// matches chronological ordering.
    pub const RECORDS_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL DEFAULT 'unknown',
            occurred_at TEXT NOT NULL,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
            hex_res6 TEXT NOT NULL,
            hex_res7 TEXT NOT NULL,
            hex_res8 TEXT NOT NULL,
            risk_score REAL,
            raw_payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#;

    /// SQL for creating the record indexes used by bounding-box queries
    pub const RECORDS_INDEXES: &'static [&'static str] = &[
        "CREATE INDEX IF NOT EXISTS idx_records_lat_lng ON records(lat, lng)",
        "CREATE INDEX IF NOT EXISTS idx_records_time_lat_lng ON records(occurred_at, lat, lng)",
        "CREATE INDEX IF NOT EXISTS idx_records_category_time ON records(category, occurred_at)",
    ];

    /// SQL for creating the ingestion run audit table
    pub const INGESTION_RUNS_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS ingestion_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            month TEXT NOT NULL,
            dry_run INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            records_detected INTEGER NOT NULL DEFAULT 0,
            records_expected INTEGER NOT NULL DEFAULT 0,
            records_inserted INTEGER NOT NULL DEFAULT 0,
            records_existing INTEGER NOT NULL DEFAULT 0,
            records_duplicate INTEGER NOT NULL DEFAULT 0,
            records_invalid INTEGER NOT NULL DEFAULT 0,
            archive_checksum TEXT,
            archive_url TEXT,
            error_kind TEXT,
            error_message TEXT,
            started_at TEXT,
            finished_at TEXT
        );
    "#;

    pub const INGESTION_RUNS_INDEXES: &'static [&'static str] = &[
        "CREATE INDEX IF NOT EXISTS idx_ingestion_runs_month ON ingestion_runs(month, id)",
    ];

    /// Tables that must exist for the schema to count as intact
    pub const REQUIRED_TABLES: &'static [&'static str] =
        &["hexstat_meta", "records", "ingestion_runs"];
}

/// Schema manager for the shared database
///
/// Handles schema initialization, version checking, and upgrades.
pub struct SchemaManager<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaManager<'a> {
    /// Create a new schema manager for the given connection
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Initialize the database schema
    ///
    /// Every statement is `IF NOT EXISTS`, so this also repairs a database
    /// with missing tables or an older version without touching stored records.
    pub fn initialize(&self) -> Result<()> {
        self.conn
            .execute(SchemaDefinitions::META_TABLE, [])
            .map_err(|e| anyhow!("Failed to create meta table: {}", e))?;

        self.conn
            .execute(SchemaDefinitions::RECORDS_TABLE, [])
            .map_err(|e| anyhow!("Failed to create records table: {}", e))?;

        for index_sql in SchemaDefinitions::RECORDS_INDEXES {
            self.conn
                .execute(index_sql, [])
                .map_err(|e| anyhow!("Failed to create records index: {}", e))?;
        }

        self.conn
            .execute(SchemaDefinitions::INGESTION_RUNS_TABLE, [])
            .map_err(|e| anyhow!("Failed to create ingestion_runs table: {}", e))?;

        for index_sql in SchemaDefinitions::INGESTION_RUNS_INDEXES {
            self.conn
                .execute(index_sql, [])
                .map_err(|e| anyhow!("Failed to create ingestion_runs index: {}", e))?;
        }

        self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;

        Ok(())
    }

    /// Check the current schema status
    pub fn check_status(&self) -> Result<SchemaStatus> {
        let meta_exists: i32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='hexstat_meta'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if meta_exists == 0 {
            return Ok(SchemaStatus::NotInitialized);
        }

        let current_version = self.get_schema_version()?;

        if current_version == SCHEMA_VERSION {
            if self.verify_integrity()? {
                Ok(SchemaStatus::Current)
            } else {
                Ok(SchemaStatus::Corrupted)
            }
        } else if current_version < SCHEMA_VERSION {
            Ok(SchemaStatus::NeedsMigration {
                from: current_version,
                to: SCHEMA_VERSION,
            })
        } else {
            Ok(SchemaStatus::Incompatible {
                database_version: current_version,
                required_version: SCHEMA_VERSION,
            })
        }
    }

    /// Get the current schema version from the database
    fn get_schema_version(&self) -> Result<u32> {
        let version: String = self
            .conn
            .query_row(
                "SELECT value FROM hexstat_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap_or_else(|_| "0".to_string());

        version
            .parse()
            .map_err(|e| anyhow!("Invalid schema version: {}", e))
    }

    /// Verify schema integrity by checking required tables exist
    fn verify_integrity(&self) -> Result<bool> {
        for table in SchemaDefinitions::REQUIRED_TABLES {
            let exists: i32 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap_or(0);

            if exists == 0 {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Set a metadata value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO hexstat_meta (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))",
                [key, value],
            )
            .map_err(|e| anyhow!("Failed to set meta value: {}", e))?;
        Ok(())
    }

    /// Get a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let result: Result<String, _> = self.conn.query_row(
            "SELECT value FROM hexstat_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow!("Failed to get meta value: {}", e)),
        }
    }
}

/// Status of the database schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is current and valid
    Current,

    /// Schema is from an older version and can be upgraded in place
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },

    /// Schema is missing tables
    Corrupted,
}
