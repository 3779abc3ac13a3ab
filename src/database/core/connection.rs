//! Database connection management

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::time::Duration;

/// How long a writer waits for a competing month worker to release the lock
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Core database connection wrapper
///
/// `DatabaseConn` provides a thin wrapper around SQLite connections,
/// handling both file-based and in-memory databases with consistent
/// configuration and error handling.
pub struct DatabaseConn {
    pub conn: Connection,
}

impl DatabaseConn {
    /// Open a database at the specified path
    ///
    /// If the path is `None`, an in-memory database is created.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| anyhow!("Failed to open database at '{}': {}", p, e))?,
            None => Connection::open_in_memory()
                .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?,
        };

        let db = DatabaseConn { conn };
        db.configure()?;
        Ok(db)
    }

    /// Open a database at the specified path (convenience method)
    pub fn open_path(path: &str) -> Result<Self> {
        Self::open(Some(path))
    }

    /// Create an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open(None)
    }

    fn configure(&self) -> Result<()> {
        // WAL lets aggregation readers run while an ingestion worker writes
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to set journal mode: {}", e))?;

        self.conn
            .execute("PRAGMA synchronous=NORMAL", [])
            .map_err(|e| anyhow!("Failed to set synchronous mode: {}", e))?;

        self.conn
            .execute("PRAGMA temp_store=MEMORY", [])
            .map_err(|e| anyhow!("Failed to set temp store: {}", e))?;

        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| anyhow!("Failed to set busy timeout: {}", e))?;

        Ok(())
    }

    /// Execute a SQL statement
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.conn
            .execute(sql, [])
            .map_err(|e| anyhow!("Failed to execute SQL: {}", e))
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let count: i32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [table_name],
                |row| row.get(0),
            )
            .map_err(|e| anyhow!("Failed to check table existence: {}", e))?;
        Ok(count > 0)
    }
}
