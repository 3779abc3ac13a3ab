//! Record repository for the shared database
//!
//! Records are append-only: rows are inserted once under a deterministic
//! identifier and never updated. Every insert that adds rows bumps the
//! aggregate generation counter inside the same transaction, which is what
//! invalidates memoised aggregates for the touched cells.

use crate::database::hexstat::{format_timestamp, parse_timestamp};
use crate::lens::hex::CellId;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Meta key of the counter bumped by every non-empty batch insert
pub const AGGREGATE_GENERATION_KEY: &str = "aggregate_generation";

/// Largest number of bound parameters used in one `IN (...)` lookup
const LOOKUP_CHUNK: usize = 500;

/// A parsed, indexed record ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertableRecord {
    pub id: String,
    pub category: String,
    pub occurred_at: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub hex_res6: CellId,
    pub hex_res7: CellId,
    pub hex_res8: CellId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The columns an aggregation query needs from a stored record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPoint {
    pub category: String,
    pub occurred_at: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    pub risk_score: Option<f64>,
}

/// Storage-level filter for bounding-box scans
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub category: Option<String>,
    /// Half-open risk range `[min, max)`, closed at the top when `max >= 1.0`
    pub risk_range: Option<(f64, f64)>,
}

/// Repository for record data operations
pub struct RecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> RecordRepository<'a> {
    /// Create a new record repository
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get the total number of stored records
    pub fn count(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to count records: {}", e))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        self.count().unwrap_or(0) == 0
    }

    /// Return the subset of `ids` that is already stored
    pub fn existing_ids(&self, ids: &[&str]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let placeholders: Vec<String> = chunk.iter().map(|_| "?".to_string()).collect();
            let query = format!(
                "SELECT id FROM records WHERE id IN ({})",
                placeholders.join(",")
            );

            let mut stmt = self
                .conn
                .prepare(&query)
                .map_err(|e| anyhow!("Failed to prepare id lookup: {}", e))?;
            let params: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| row.get::<_, String>(0))
                .map_err(|e| anyhow!("Failed to look up existing ids: {}", e))?;
            for row in rows {
                existing.insert(row?);
            }
        }

        Ok(existing)
    }

    /// Insert a batch of records in one transaction
    ///
    /// Rows whose id already exists are skipped by the storage engine, so a
    /// concurrent worker racing on the same period cannot produce duplicates.
    /// Returns the number of rows actually written.
    pub fn insert_batch(&self, records: &[InsertableRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;

        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO records
                     (id, category, occurred_at, lat, lng, hex_res6, hex_res7, hex_res8,
                      risk_score, raw_payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )
                .map_err(|e| anyhow!("Failed to prepare record insert: {}", e))?;

            for record in records {
                inserted += stmt
                    .execute(params![
                        record.id,
                        record.category,
                        format_timestamp(&record.occurred_at),
                        record.lat,
                        record.lng,
                        record.hex_res6.as_str(),
                        record.hex_res7.as_str(),
                        record.hex_res8.as_str(),
                        record.risk_score,
                        record.raw_payload.to_string(),
                        format_timestamp(&record.created_at),
                        format_timestamp(&record.updated_at),
                    ])
                    .map_err(|e| anyhow!("Failed to insert record {}: {}", record.id, e))?;
            }
        }

        if inserted > 0 {
            tx.execute(
                "INSERT INTO hexstat_meta (key, value, updated_at) VALUES (?1, '1', strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET
                     value = CAST(CAST(value AS INTEGER) + 1 AS TEXT),
                     updated_at = strftime('%s', 'now')",
                [AGGREGATE_GENERATION_KEY],
            )
            .map_err(|e| anyhow!("Failed to bump aggregate generation: {}", e))?;
        }

        tx.commit()
            .map_err(|e| anyhow!("Failed to commit record batch: {}", e))?;

        debug!(
            "Inserted {} of {} records in batch",
            inserted,
            records.len()
        );
        Ok(inserted)
    }

    /// Current aggregate generation; 0 before the first insert
    pub fn aggregate_generation(&self) -> Result<u64> {
        let result: Result<String, _> = self.conn.query_row(
            "SELECT value FROM hexstat_meta WHERE key = ?1",
            [AGGREGATE_GENERATION_KEY],
            |row| row.get(0),
        );

        match result {
            Ok(value) => value
                .parse()
                .map_err(|e| anyhow!("Invalid aggregate generation '{}': {}", value, e)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(anyhow!("Failed to read aggregate generation: {}", e)),
        }
    }

    /// Check whether any record carries the given category
    pub fn category_exists(&self, category: &str) -> Result<bool> {
        let found: Option<i64> = match self.conn.query_row(
            "SELECT 1 FROM records WHERE category = ?1 LIMIT 1",
            [category],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(anyhow!("Failed to look up category: {}", e)),
        };
        Ok(found.is_some())
    }

    /// Fetch the records inside a bounding box matching the storage-level filters
    pub fn query_points(&self, filter: &RecordFilter) -> Result<Vec<RecordPoint>> {
        let mut conditions = vec![
            "lat >= ?".to_string(),
            "lat <= ?".to_string(),
            "lng >= ?".to_string(),
            "lng <= ?".to_string(),
        ];
        let mut values: Vec<rusqlite::types::Value> = vec![
            filter.south.into(),
            filter.north.into(),
            filter.west.into(),
            filter.east.into(),
        ];

        if let Some(from) = &filter.from {
            conditions.push("occurred_at >= ?".to_string());
            values.push(format_timestamp(from).into());
        }
        if let Some(to) = &filter.to {
            conditions.push("occurred_at <= ?".to_string());
            values.push(format_timestamp(to).into());
        }
        if let Some(category) = &filter.category {
            conditions.push("category = ?".to_string());
            values.push(category.clone().into());
        }
        if let Some((min, max)) = filter.risk_range {
            conditions.push("risk_score IS NOT NULL".to_string());
            conditions.push("risk_score >= ?".to_string());
            values.push(min.into());
            if max >= 1.0 {
                conditions.push("risk_score <= ?".to_string());
            } else {
                conditions.push("risk_score < ?".to_string());
            }
            values.push(max.into());
        }

        let query = format!(
            "SELECT category, occurred_at, lat, lng, risk_score FROM records WHERE {}",
            conditions.join(" AND ")
        );

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|e| anyhow!("Failed to prepare bounding-box query: {}", e))?;

        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })
            .map_err(|e| anyhow!("Failed to run bounding-box query: {}", e))?;

        let mut points = Vec::new();
        for row in rows {
            let (category, occurred_at, lat, lng, risk_score) = row?;
            let occurred_at = parse_timestamp(&occurred_at)
                .ok_or_else(|| anyhow!("Stored record has invalid timestamp '{}'", occurred_at))?;
            points.push(RecordPoint {
                category,
                occurred_at,
                lat,
                lng,
                risk_score,
            });
        }

        Ok(points)
    }
}
