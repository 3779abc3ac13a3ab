//! Ingestion run audit log
//!
//! One row per ingestion attempt. A run is created `pending`, moves to
//! `running` when the pipeline picks it up and ends as `completed` or
//! `failed`. Terminal rows are never updated again.

use crate::database::hexstat::{format_timestamp, parse_timestamp};
use crate::error::FailureKind;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("Unknown run status: {}", other)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record counters gathered while a run progresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    /// Data rows seen in the archive
    pub records_detected: u64,
    /// Rows that survived validation and in-run deduplication
    pub records_expected: u64,
    /// Rows written (or that would have been written on a dry run)
    pub records_inserted: u64,
    /// Rows skipped because storage already held their identifier
    pub records_existing: u64,
    pub records_duplicate: u64,
    pub records_invalid: u64,
}

/// Audit record of one ingestion attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRun {
    pub id: i64,
    pub month: String,
    pub dry_run: bool,
    pub status: RunStatus,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub archive_checksum: Option<String>,
    pub archive_url: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration of a finished run
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Repository for ingestion run audit rows
pub struct IngestionRunRepository<'a> {
    conn: &'a Connection,
}

const RUN_COLUMNS: &str = "id, month, dry_run, status, records_detected, records_expected,
    records_inserted, records_existing, records_duplicate, records_invalid,
    archive_checksum, archive_url, error_kind, error_message, started_at, finished_at";

impl<'a> IngestionRunRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a pending run for a period
    pub fn create(&self, month: &str, dry_run: bool) -> Result<IngestionRun> {
        self.conn
            .execute(
                "INSERT INTO ingestion_runs (month, dry_run, status) VALUES (?1, ?2, ?3)",
                params![month, dry_run, RunStatus::Pending.as_str()],
            )
            .map_err(|e| anyhow!("Failed to create ingestion run: {}", e))?;

        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| anyhow!("Ingestion run {} vanished after insert", id))
    }

    /// Move a pending run to running and stamp its start time
    pub fn mark_running(&self, id: i64) -> Result<IngestionRun> {
        let now = format_timestamp(&Utc::now());
        let updated = self
            .conn
            .execute(
                "UPDATE ingestion_runs SET status = ?1, started_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    RunStatus::Running.as_str(),
                    now,
                    id,
                    RunStatus::Pending.as_str()
                ],
            )
            .map_err(|e| anyhow!("Failed to mark run {} running: {}", id, e))?;

        if updated == 0 {
            return Err(anyhow!("Ingestion run {} is not pending", id));
        }
        self.require(id)
    }

    /// Persist intermediate counters on a running run
    pub fn update_progress(&self, id: i64, counters: &RunCounters) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingestion_runs SET
                     records_detected = ?1, records_expected = ?2, records_inserted = ?3,
                     records_existing = ?4, records_duplicate = ?5, records_invalid = ?6
                 WHERE id = ?7 AND status = ?8",
                params![
                    counters.records_detected as i64,
                    counters.records_expected as i64,
                    counters.records_inserted as i64,
                    counters.records_existing as i64,
                    counters.records_duplicate as i64,
                    counters.records_invalid as i64,
                    id,
                    RunStatus::Running.as_str()
                ],
            )
            .map_err(|e| anyhow!("Failed to update progress of run {}: {}", id, e))?;
        Ok(())
    }

    /// Record the archive a run is working from
    pub fn set_archive(&self, id: i64, url: &str, checksum: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingestion_runs SET archive_url = ?1, archive_checksum = ?2
                 WHERE id = ?3 AND status IN ('pending', 'running')",
                params![url, checksum, id],
            )
            .map_err(|e| anyhow!("Failed to record archive for run {}: {}", id, e))?;
        Ok(())
    }

    /// Finish a run successfully with its final counters
    pub fn complete(&self, id: i64, counters: &RunCounters) -> Result<IngestionRun> {
        let now = format_timestamp(&Utc::now());
        let updated = self
            .conn
            .execute(
                "UPDATE ingestion_runs SET
                     status = ?1, finished_at = ?2,
                     started_at = COALESCE(started_at, ?2),
                     records_detected = ?3, records_expected = ?4, records_inserted = ?5,
                     records_existing = ?6, records_duplicate = ?7, records_invalid = ?8
                 WHERE id = ?9 AND status IN ('pending', 'running')",
                params![
                    RunStatus::Completed.as_str(),
                    now,
                    counters.records_detected as i64,
                    counters.records_expected as i64,
                    counters.records_inserted as i64,
                    counters.records_existing as i64,
                    counters.records_duplicate as i64,
                    counters.records_invalid as i64,
                    id
                ],
            )
            .map_err(|e| anyhow!("Failed to complete run {}: {}", id, e))?;

        if updated == 0 {
            return Err(anyhow!("Ingestion run {} is already finished", id));
        }
        self.require(id)
    }

    /// Finish a run as failed
    ///
    /// `message` is stored as given; callers pass an already redacted message.
    pub fn fail(
        &self,
        id: i64,
        kind: FailureKind,
        message: &str,
        counters: &RunCounters,
    ) -> Result<IngestionRun> {
        let now = format_timestamp(&Utc::now());
        let updated = self
            .conn
            .execute(
                "UPDATE ingestion_runs SET
                     status = ?1, finished_at = ?2,
                     started_at = COALESCE(started_at, ?2),
                     error_kind = ?3, error_message = ?4,
                     records_detected = ?5, records_expected = ?6, records_inserted = ?7,
                     records_existing = ?8, records_duplicate = ?9, records_invalid = ?10
                 WHERE id = ?11 AND status IN ('pending', 'running')",
                params![
                    RunStatus::Failed.as_str(),
                    now,
                    kind.as_str(),
                    message,
                    counters.records_detected as i64,
                    counters.records_expected as i64,
                    counters.records_inserted as i64,
                    counters.records_existing as i64,
                    counters.records_duplicate as i64,
                    counters.records_invalid as i64,
                    id
                ],
            )
            .map_err(|e| anyhow!("Failed to mark run {} failed: {}", id, e))?;

        if updated == 0 {
            return Err(anyhow!("Ingestion run {} is already finished", id));
        }
        self.require(id)
    }

    pub fn get(&self, id: i64) -> Result<Option<IngestionRun>> {
        let query = format!("SELECT {} FROM ingestion_runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&query, [id], row_to_run)
            .optional()
            .map_err(|e| anyhow!("Failed to load ingestion run {}: {}", id, e))
    }

    /// Most recent runs first
    pub fn recent(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let query = format!(
            "SELECT {} FROM ingestion_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| anyhow!("Failed to prepare run listing: {}", e))?;
        let runs = stmt
            .query_map([limit as i64], row_to_run)
            .map_err(|e| anyhow!("Failed to list ingestion runs: {}", e))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Latest run for one period, whatever its status
    pub fn latest_for_period(&self, month: &str) -> Result<Option<IngestionRun>> {
        let query = format!(
            "SELECT {} FROM ingestion_runs WHERE month = ?1 ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        );
        self.conn
            .query_row(&query, [month], row_to_run)
            .optional()
            .map_err(|e| anyhow!("Failed to load latest run for {}: {}", month, e))
    }

    fn require(&self, id: i64) -> Result<IngestionRun> {
        self.get(id)?
            .ok_or_else(|| anyhow!("Ingestion run {} not found", id))
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<IngestionRun> {
    let status: String = row.get(3)?;
    let status = status.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let error_kind: Option<String> = row.get(12)?;
    let started_at: Option<String> = row.get(14)?;
    let finished_at: Option<String> = row.get(15)?;

    Ok(IngestionRun {
        id: row.get(0)?,
        month: row.get(1)?,
        dry_run: row.get(2)?,
        status,
        counters: RunCounters {
            records_detected: row.get::<_, i64>(4)? as u64,
            records_expected: row.get::<_, i64>(5)? as u64,
            records_inserted: row.get::<_, i64>(6)? as u64,
            records_existing: row.get::<_, i64>(7)? as u64,
            records_duplicate: row.get::<_, i64>(8)? as u64,
            records_invalid: row.get::<_, i64>(9)? as u64,
        },
        archive_checksum: row.get(10)?,
        archive_url: row.get(11)?,
        error_kind: error_kind.as_deref().and_then(FailureKind::from_str),
        error_message: row.get(13)?,
        started_at: started_at.as_deref().and_then(parse_timestamp),
        finished_at: finished_at.as_deref().and_then(parse_timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::HexstatDatabase;

    #[test]
    fn test_run_lifecycle() {
        let db = HexstatDatabase::open_in_memory().unwrap();
        let runs = db.runs();

        let run = runs.create("2024-01", false).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());

        let run = runs.mark_running(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        runs.set_archive(run.id, "https://example.org/2024-01.zip", Some("abc"))
            .unwrap();

        let counters = RunCounters {
            records_detected: 10,
            records_expected: 8,
            records_inserted: 6,
            records_existing: 2,
            records_duplicate: 1,
            records_invalid: 1,
        };
        let run = runs.complete(run.id, &counters).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counters, counters);
        assert_eq!(run.archive_checksum.as_deref(), Some("abc"));
        assert!(run.finished_at.is_some());
        assert!(run.duration_secs().unwrap() >= 0);
    }

    #[test]
    fn test_terminal_runs_do_not_transition() {
        let db = HexstatDatabase::open_in_memory().unwrap();
        let runs = db.runs();

        let run = runs.create("2024-02", true).unwrap();
        let run = runs
            .fail(
                run.id,
                FailureKind::ArchiveNotFound,
                "no archive published for period 2024-02",
                &RunCounters::default(),
            )
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_kind, Some(FailureKind::ArchiveNotFound));
        assert!(run.dry_run);

        assert!(runs.complete(run.id, &RunCounters::default()).is_err());
        assert!(runs.mark_running(run.id).is_err());
        assert_eq!(runs.get(run.id).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_recent_and_latest_for_period() {
        let db = HexstatDatabase::open_in_memory().unwrap();
        let runs = db.runs();

        let first = runs.create("2024-01", false).unwrap();
        runs.create("2024-02", false).unwrap();
        let third = runs.create("2024-01", true).unwrap();

        let recent = runs.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, third.id);

        let latest = runs.latest_for_period("2024-01").unwrap().unwrap();
        assert_eq!(latest.id, third.id);
        assert_ne!(latest.id, first.id);
        assert!(runs.latest_for_period("2023-12").unwrap().is_none());
        assert!(runs.get(9999).unwrap().is_none());
    }
}
