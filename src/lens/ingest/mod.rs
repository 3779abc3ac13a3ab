//! Single-period ingestion pipeline
//!
//! [`IngestPipeline::ingest`] is the one entry point the orchestrator calls
//! per month. It records an [`IngestionRun`], downloads and verifies the
//! archive, streams its records through the parser and flushes them in
//! bounded batches through [`BatchInserter`].
//!
//! Failures never escape as errors once the run row exists: the run is
//! marked failed with a classified [`FailureKind`] and a message with
//! filesystem paths redacted, and returned like a successful one. Only a
//! failure to write the run row itself is returned as `Err`.
//!
//! # Example
//!
//! ```rust,ignore
//! use hexstat::database::HexstatDatabase;
//! use hexstat::lens::ingest::IngestPipeline;
//!
//! let db = HexstatDatabase::open_in_dir(&config.data_dir)?;
//! let pipeline = IngestPipeline::new(&db, &config);
//! let run = pipeline.ingest("2024-01", false)?;
//! println!("{} inserted, {} already stored", run.counters.records_inserted, run.counters.records_existing);
//! ```

use crate::config::HexstatConfig;
use crate::database::{HexstatDatabase, IngestionRun, InsertableRecord, RunCounters};
use crate::error::{FailureKind, IngestError};
use crate::lens::archive::{ArchiveDownloader, DownloadProgressCallback};
use crate::lens::hex::{ChainedIndexer, HexIndexer};
use crate::lens::parse::{HeaderMapping, ParseCounters, RecordParser};
use crate::lens::time::Period;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Batch inserter
// =============================================================================

/// Outcome of flushing one buffered chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub processed: u64,
    pub inserted: u64,
    pub existing: u64,
}

/// Writes buffered records, skipping identifiers storage already holds
pub struct BatchInserter<'a> {
    db: &'a HexstatDatabase,
    dry_run: bool,
}

impl<'a> BatchInserter<'a> {
    pub fn new(db: &'a HexstatDatabase, dry_run: bool) -> Self {
        Self { db, dry_run }
    }

    /// Flush `buffer`, leaving it empty whatever the outcome
    ///
    /// On a dry run nothing is written and `inserted` counts the records
    /// that would have been. A non-empty insert bumps the aggregate
    /// generation in the same transaction, invalidating cached aggregates.
    pub fn flush(&self, buffer: &mut Vec<InsertableRecord>) -> Result<FlushStats> {
        let records = std::mem::take(buffer);
        if records.is_empty() {
            return Ok(FlushStats::default());
        }

        let repo = self.db.records();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let existing_ids: HashSet<String> = repo.existing_ids(&ids)?;

        let fresh: Vec<InsertableRecord> = records
            .iter()
            .filter(|r| !existing_ids.contains(&r.id))
            .cloned()
            .collect();

        let processed = records.len() as u64;
        let mut existing = (records.len() - fresh.len()) as u64;

        let inserted = if self.dry_run || fresh.is_empty() {
            fresh.len() as u64
        } else {
            let written = repo.insert_batch(&fresh)? as u64;
            // rows a concurrent worker stored between lookup and insert
            existing += fresh.len() as u64 - written;
            written
        };

        debug!(
            "flushed {} records: {} inserted, {} existing{}",
            processed,
            inserted,
            existing,
            if self.dry_run { " (dry run)" } else { "" }
        );

        Ok(FlushStats {
            processed,
            inserted,
            existing,
        })
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Ingestion progress events
#[derive(Debug, Clone)]
pub enum IngestProgress {
    Started {
        run_id: i64,
        period: String,
    },
    Downloaded {
        bytes: u64,
        checksum: String,
    },
    BatchFlushed {
        stats: FlushStats,
        total_inserted: u64,
    },
    Completed {
        run: IngestionRun,
    },
    Failed {
        run: IngestionRun,
    },
}

pub type IngestProgressCallback = Arc<dyn Fn(IngestProgress) + Send + Sync>;

pub struct IngestPipeline<'a> {
    db: &'a HexstatDatabase,
    downloader: ArchiveDownloader,
    indexer: Arc<dyn HexIndexer>,
    mapping: HeaderMapping,
    url_template: String,
    batch_size: usize,
    cancel: CancellationToken,
    progress: Option<IngestProgressCallback>,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(db: &'a HexstatDatabase, config: &HexstatConfig) -> Self {
        Self {
            db,
            downloader: ArchiveDownloader::from_config(config),
            indexer: Arc::new(ChainedIndexer::default()),
            mapping: HeaderMapping::default(),
            url_template: config.archive_url_template.clone(),
            batch_size: config.batch_size.max(1),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn HexIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_header_mapping(mut self, mapping: HeaderMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Share a cancellation token with the download and the parse
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.downloader = self.downloader.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, callback: IngestProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_download_progress(mut self, callback: DownloadProgressCallback) -> Self {
        self.downloader = self.downloader.with_progress(callback);
        self
    }

    /// Ingest one period from the configured archive source
    pub fn ingest(&self, period: &str, dry_run: bool) -> Result<IngestionRun> {
        let url = self.url_template.replace("{period}", period.trim());
        self.ingest_from_url(period, &url, dry_run)
    }

    /// Ingest one period from an explicit archive URL
    pub fn ingest_from_url(&self, period: &str, url: &str, dry_run: bool) -> Result<IngestionRun> {
        let period = period.trim();
        let runs = self.db.runs();
        let run = runs.create(period, dry_run)?;
        let run = runs.mark_running(run.id)?;
        info!(
            "ingestion run {} started for {}{}",
            run.id,
            period,
            if dry_run { " (dry run)" } else { "" }
        );
        self.emit(IngestProgress::Started {
            run_id: run.id,
            period: period.to_string(),
        });

        let mut counters = RunCounters::default();
        match self.execute(run.id, period, url, dry_run, &mut counters) {
            Ok(()) => {
                let run = retry_once("complete", run.id, || runs.complete(run.id, &counters))?;
                info!(
                    "ingestion run {} completed: {} detected, {} inserted, {} existing, {} duplicate, {} invalid",
                    run.id,
                    counters.records_detected,
                    counters.records_inserted,
                    counters.records_existing,
                    counters.records_duplicate,
                    counters.records_invalid
                );
                self.emit(IngestProgress::Completed { run: run.clone() });
                Ok(run)
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.public_message();
                match kind {
                    FailureKind::ArchiveNotFound => {
                        info!("ingestion run {} found no archive: {}", run.id, message)
                    }
                    _ => warn!("ingestion run {} failed ({}): {}", run.id, kind, message),
                }
                let run = retry_once("record the failure of", run.id, || {
                    runs.fail(run.id, kind, &message, &counters)
                })?;
                self.emit(IngestProgress::Failed { run: run.clone() });
                Ok(run)
            }
        }
    }

    fn execute(
        &self,
        run_id: i64,
        period: &str,
        url: &str,
        dry_run: bool,
        counters: &mut RunCounters,
    ) -> Result<(), IngestError> {
        let period: Period = period
            .parse()
            .map_err(|_| IngestError::InvalidPeriod(period.to_string()))?;
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let archive = self.downloader.download(&period.to_string(), url)?;
        self.db
            .runs()
            .set_archive(run_id, archive.source_url(), Some(archive.checksum()))
            .map_err(IngestError::Storage)?;
        self.emit(IngestProgress::Downloaded {
            bytes: archive.bytes(),
            checksum: archive.checksum().to_string(),
        });

        let parser = RecordParser::new(self.indexer.clone(), self.mapping.clone())
            .with_period(period)
            .with_cancellation(self.cancel.clone());
        let mut stream = parser.parse_archive(archive.path())?;
        let inserter = BatchInserter::new(self.db, dry_run);
        let mut buffer: Vec<InsertableRecord> = Vec::with_capacity(self.batch_size);

        while let Some(record) = stream.next() {
            buffer.push(record?);
            if buffer.len() >= self.batch_size {
                self.flush(run_id, &inserter, &mut buffer, counters, stream.counters())?;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.flush(run_id, &inserter, &mut buffer, counters, stream.counters())?;
        apply_parse_counters(counters, stream.counters());
        Ok(())
    }

    fn flush(
        &self,
        run_id: i64,
        inserter: &BatchInserter<'_>,
        buffer: &mut Vec<InsertableRecord>,
        counters: &mut RunCounters,
        parsed: ParseCounters,
    ) -> Result<(), IngestError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let stats = inserter.flush(buffer).map_err(IngestError::Storage)?;
        counters.records_inserted += stats.inserted;
        counters.records_existing += stats.existing;
        apply_parse_counters(counters, parsed);

        self.db
            .runs()
            .update_progress(run_id, counters)
            .map_err(IngestError::Storage)?;
        self.emit(IngestProgress::BatchFlushed {
            stats,
            total_inserted: counters.records_inserted,
        });
        Ok(())
    }

    fn emit(&self, event: IngestProgress) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }
}

/// Run a status update, retrying once after a logged failure
///
/// A run left `running` is never picked up again, so one transient storage
/// error should not strand it.
fn retry_once<T>(action: &str, run_id: i64, mut update: impl FnMut() -> Result<T>) -> Result<T> {
    match update() {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("failed to {} run {}, retrying: {}", action, run_id, e);
            update()
        }
    }
}

fn apply_parse_counters(counters: &mut RunCounters, parsed: ParseCounters) {
    counters.records_detected = parsed.detected;
    counters.records_expected = parsed.expected;
    counters.records_duplicate = parsed.duplicates;
    counters.records_invalid = parsed.invalid;
}

// =============================================================================
// Tests
// =============================================================================
