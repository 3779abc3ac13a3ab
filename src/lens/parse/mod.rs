//! Archive record parser
//!
//! Streams the event CSV entries of a downloaded archive as
//! [`InsertableRecord`]s. Only entries whose file stem ends in one of the
//! configured event kinds are read, so a police.uk archive yields its
//! `-street.csv` files and skips `-outcomes.csv` and `-stop-and-search.csv`.
//! When a period is set, entries filed under another month are skipped too.
//!
//! Each row is normalised, validated, given a deterministic identifier,
//! deduplicated against the rows already seen in this run and indexed into
//! hex cells at the stored resolutions.
//!
//! Rows that cannot be used (unparseable month, missing or non-numeric
//! coordinates) are counted and skipped rather than failing the run. Only
//! structural problems such as an unreadable entry surface as errors.
//!
//! ```rust,ignore
//! use hexstat::lens::parse::{HeaderMapping, RecordParser};
//!
//! let parser = RecordParser::new(indexer, HeaderMapping::default());
//! let mut stream = parser.parse_archive(archive.path())?;
//! for record in &mut stream {
//!     let record = record?;
//!     // buffer and flush
//! }
//! let counters = stream.counters();
//! ```

use crate::database::InsertableRecord;
use crate::error::IngestError;
use crate::lens::hex::HexIndexer;
use crate::lens::time::Period;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Category given to rows that carry none
pub const UNKNOWN_CATEGORY: &str = "unknown";

// =============================================================================
// Types
// =============================================================================

/// Row counters reported alongside the record stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseCounters {
    /// Data rows read from every entry
    pub detected: u64,
    /// Rows emitted as records
    pub expected: u64,
    /// Rows dropped because their identifier was already seen in this run
    pub duplicates: u64,
    /// Rows dropped for an unparseable month or unusable coordinates
    pub invalid: u64,
}

/// Normalised column names accepted for each field, in preference order
///
/// `entry_kinds` selects which CSV entries hold events: an entry is read
/// when its lowercased file stem equals a kind or ends in `-<kind>`. An
/// empty list reads every CSV entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMapping {
    pub entry_kinds: Vec<String>,
    pub period: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub category: Vec<String>,
    pub risk_score: Vec<String>,
    pub id: Vec<String>,
    pub location: Vec<String>,
}

impl Default for HeaderMapping {
    fn default() -> Self {
        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            entry_kinds: names(&["street"]),
            period: names(&["month", "period", "date"]),
            latitude: names(&["latitude", "lat"]),
            longitude: names(&["longitude", "lng", "lon", "long"]),
            category: names(&["crime_type", "category", "type"]),
            risk_score: names(&["risk_score", "risk", "severity_score"]),
            id: names(&["crime_id", "id", "persistent_id"]),
            location: names(&["location", "street", "location_name"]),
        }
    }
}

impl HeaderMapping {
    /// Whether an archive entry holds event rows
    pub fn is_event_entry(&self, name: &str) -> bool {
        if !is_csv_entry(name) {
            return false;
        }
        if self.entry_kinds.is_empty() {
            return true;
        }

        let stem = entry_stem(name);
        self.entry_kinds.iter().any(|kind| {
            let kind = kind.to_ascii_lowercase();
            stem == kind || stem.ends_with(&format!("-{}", kind))
        })
    }

    fn resolve(&self, headers: &[String]) -> ColumnIndex {
        let find = |aliases: &[String]| {
            aliases
                .iter()
                .find_map(|alias| headers.iter().position(|h| h == alias))
        };

        ColumnIndex {
            period: find(&self.period),
            lat: find(&self.latitude),
            lng: find(&self.longitude),
            category: find(&self.category),
            risk: find(&self.risk_score),
            id: find(&self.id),
            location: find(&self.location),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ColumnIndex {
    period: Option<usize>,
    lat: Option<usize>,
    lng: Option<usize>,
    category: Option<usize>,
    risk: Option<usize>,
    id: Option<usize>,
    location: Option<usize>,
}

// =============================================================================
// Parser
// =============================================================================

pub struct RecordParser {
    indexer: Arc<dyn HexIndexer>,
    mapping: HeaderMapping,
    period: Option<Period>,
    cancel: CancellationToken,
}

impl RecordParser {
    pub fn new(indexer: Arc<dyn HexIndexer>, mapping: HeaderMapping) -> Self {
        Self {
            indexer,
            mapping,
            period: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Skip entries filed under a month other than `period`
    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Open an archive and stream its records
    ///
    /// Every call starts from the first row again with an empty seen-set.
    pub fn parse_archive(&self, path: &Path) -> Result<RecordStream, IngestError> {
        let file = File::open(path)
            .map_err(|e| IngestError::Archive(format!("cannot open archive: {}", e)))?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|e| IngestError::Archive(format!("cannot read archive: {}", e)))?;

        let mut entries: Vec<String> = archive
            .file_names()
            .filter(|name| self.mapping.is_event_entry(name))
            .filter(|name| match (self.period, entry_period(name)) {
                (Some(wanted), Some(filed)) => wanted == filed,
                _ => true,
            })
            .map(str::to_string)
            .collect();
        entries.sort();

        if entries.is_empty() {
            return Err(IngestError::Archive(
                "archive contains no event CSV entries".to_string(),
            ));
        }
        debug!("archive holds {} event CSV entries", entries.len());

        let scratch = path.with_file_name(format!(
            ".{}.entry.csv",
            uuid::Uuid::new_v4().simple()
        ));

        Ok(RecordStream {
            archive,
            pending: entries.into(),
            scratch,
            current: None,
            row: csv::ByteRecord::new(),
            cancel: self.cancel.clone(),
            finished: false,
            state: RowState {
                indexer: self.indexer.clone(),
                mapping: self.mapping.clone(),
                seen: HashSet::new(),
                counters: ParseCounters::default(),
                now: Utc::now(),
            },
        })
    }
}

/// Lazy, finite stream of records from one archive
///
/// After the first error the stream yields nothing more. The scratch file
/// used to stage the current entry is removed on drop.
pub struct RecordStream {
    archive: zip::ZipArchive<File>,
    pending: VecDeque<String>,
    scratch: PathBuf,
    current: Option<EntryReader>,
    row: csv::ByteRecord,
    cancel: CancellationToken,
    finished: bool,
    state: RowState,
}

struct EntryReader {
    name: String,
    reader: csv::Reader<File>,
    headers: Vec<String>,
    columns: ColumnIndex,
}

struct RowState {
    indexer: Arc<dyn HexIndexer>,
    mapping: HeaderMapping,
    seen: HashSet<String>,
    counters: ParseCounters,
    now: DateTime<Utc>,
}

impl RecordStream {
    pub fn counters(&self) -> ParseCounters {
        self.state.counters
    }

    fn open_entry(&mut self, name: &str) -> Result<EntryReader, IngestError> {
        {
            let mut entry = self.archive.by_name(name).map_err(|e| {
                IngestError::Archive(format!("cannot open entry {}: {}", name, e))
            })?;
            let mut out = File::create(&self.scratch)
                .map_err(|e| IngestError::Archive(format!("cannot stage entry {}: {}", name, e)))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| IngestError::Archive(format!("cannot extract entry {}: {}", name, e)))?;
        }

        let file = File::open(&self.scratch)
            .map_err(|e| IngestError::Archive(format!("cannot reopen entry {}: {}", name, e)))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers: Vec<String> = reader
            .byte_headers()
            .map_err(|e| IngestError::Archive(format!("cannot read header of {}: {}", name, e)))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let normalised = normalize_header(&String::from_utf8_lossy(h));
                if normalised.is_empty() {
                    format!("column_{}", i + 1)
                } else {
                    normalised
                }
            })
            .collect();

        let columns = self.state.mapping.resolve(&headers);
        if columns.period.is_none() || columns.lat.is_none() || columns.lng.is_none() {
            warn!(
                "entry {} lacks a month or coordinate column, its rows will be counted invalid",
                name
            );
        }

        Ok(EntryReader {
            name: name.to_string(),
            reader,
            headers,
            columns,
        })
    }

    fn fail(&mut self, err: IngestError) -> Option<Result<InsertableRecord, IngestError>> {
        self.finish();
        Some(Err(err))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.current = None;
        remove_scratch(&self.scratch);
    }
}

impl Iterator for RecordStream {
    type Item = Result<InsertableRecord, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.fail(IngestError::Cancelled);
            }

            if self.current.is_none() {
                let Some(name) = self.pending.pop_front() else {
                    self.finish();
                    return None;
                };
                match self.open_entry(&name) {
                    Ok(entry) => {
                        debug!("parsing entry {}", name);
                        self.current = Some(entry);
                    }
                    Err(e) => return self.fail(e),
                }
            }

            let Some(entry) = self.current.as_mut() else {
                continue;
            };
            match entry.reader.read_byte_record(&mut self.row) {
                Ok(true) => {}
                Ok(false) => {
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    let msg = format!("cannot read row of {}: {}", entry.name, e);
                    return self.fail(IngestError::Archive(msg));
                }
            }

            self.state.counters.detected += 1;
            let result = self
                .state
                .transform(&self.row, &entry.headers, &entry.columns);
            match result {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        self.current = None;
        remove_scratch(&self.scratch);
    }
}

impl RowState {
    fn transform(
        &mut self,
        row: &csv::ByteRecord,
        headers: &[String],
        columns: &ColumnIndex,
    ) -> Result<Option<InsertableRecord>, IngestError> {
        let field = |idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| row.get(i))
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let period_raw = field(columns.period);
        let Some(period) = period_raw.as_deref().and_then(Period::parse_prefix) else {
            self.counters.invalid += 1;
            return Ok(None);
        };

        let lat = parse_coordinate(field(columns.lat), 90.0);
        let lng = parse_coordinate(field(columns.lng), 180.0);
        let (Some(lat), Some(lng)) = (lat, lng) else {
            self.counters.invalid += 1;
            return Ok(None);
        };

        let category = field(columns.category).unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
        let risk_score = field(columns.risk)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|r| r.is_finite() && (0.0..=1.0).contains(r));
        let location = field(columns.location).unwrap_or_default();
        let id = field(columns.id)
            .unwrap_or_else(|| derive_record_id(&period, &category, lat, lng, &location));

        if !self.seen.insert(id.clone()) {
            self.counters.duplicates += 1;
            return Ok(None);
        }

        let occurred_at = period_raw
            .as_deref()
            .and_then(parse_occurred_at)
            .filter(|ts| Period::containing(ts) == period)
            .unwrap_or_else(|| period.month_start());

        let hex_res6 = self.indexer.cell_for(lat, lng, 6)?;
        let hex_res7 = self.indexer.cell_for(lat, lng, 7)?;
        let hex_res8 = self.indexer.cell_for(lat, lng, 8)?;

        let raw_payload = serde_json::Value::Object(
            row.iter()
                .enumerate()
                .map(|(i, value)| {
                    let key = headers
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", i + 1));
                    let value = String::from_utf8_lossy(value).into_owned();
                    (key, serde_json::Value::String(value))
                })
                .collect(),
        );

        self.counters.expected += 1;
        Ok(Some(InsertableRecord {
            id,
            category,
            occurred_at,
            lat,
            lng,
            hex_res6,
            hex_res7,
            hex_res8,
            risk_score,
            raw_payload,
            created_at: self.now,
            updated_at: self.now,
        }))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Lowercase, strip a BOM, collapse non-alphanumeric runs to `_` and trim `_`
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;

    for c in header.trim_start_matches('\u{feff}').chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Deterministic UUID-shaped identifier for a row without a natural key
///
/// SHA-1 over `month|category|lat|lng|location`, first 32 hex characters
/// grouped 8-4-4-4-12.
pub fn derive_record_id(period: &Period, category: &str, lat: f64, lng: f64, location: &str) -> String {
    let key = format!("{}|{}|{:.6}|{:.6}|{}", period, category, lat, lng, location);
    let digest = Sha1::digest(key.as_bytes());
    let h = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Round a coordinate to 6 decimal places
pub fn round_coordinate(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

fn parse_coordinate(value: Option<String>, limit: f64) -> Option<f64> {
    value?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
        .map(round_coordinate)
}

/// Full timestamp carried by a period field, when it has more than `YYYY-MM`
fn parse_occurred_at(value: &str) -> Option<DateTime<Utc>> {
    if value.len() <= 7 {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn is_csv_entry(name: &str) -> bool {
    !name.ends_with('/')
        && !name.starts_with("__MACOSX/")
        && name.to_ascii_lowercase().ends_with(".csv")
}

/// Lowercased file name without directories or extension
fn entry_stem(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    let stem = match file.rfind('.') {
        Some(dot) => &file[..dot],
        None => file,
    };
    stem.to_ascii_lowercase()
}

/// Month an entry is filed under, from its folder or its file name prefix
fn entry_period(name: &str) -> Option<Period> {
    let mut parts = name.rsplit('/');
    let file = parts.next()?;
    if let Some(folder) = parts.next() {
        if let Ok(period) = folder.parse::<Period>() {
            return Some(period);
        }
    }
    Period::parse_prefix(file)
}

fn remove_scratch(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove scratch file: {}", e),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexingError;
    use crate::lens::hex::{CellId, H3Indexer};
    use crate::test_support::{zip_bytes, zip_bytes_raw, STREET_CSV};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn write_archive(dir: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("2024-01.test.zip");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn parser() -> RecordParser {
        RecordParser::new(Arc::new(H3Indexer::new()), HeaderMapping::default())
    }

    fn collect(path: &Path) -> (Vec<InsertableRecord>, ParseCounters) {
        let mut stream = parser().parse_archive(path).unwrap();
        let records: Vec<InsertableRecord> = stream.by_ref().map(|r| r.unwrap()).collect();
        (records, stream.counters())
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("\u{feff}Crime ID"), "crime_id");
        assert_eq!(normalize_header("  Crime   type "), "crime_type");
        assert_eq!(normalize_header("LSOA-code"), "lsoa_code");
        assert_eq!(normalize_header("__Latitude__"), "latitude");
        assert_eq!(normalize_header("Falls within / region"), "falls_within_region");
        assert_eq!(normalize_header("***"), "");
    }

    #[test]
    fn test_derive_record_id() {
        let period = Period::new(2024, 1).unwrap();
        let a = derive_record_id(&period, "burglary", 51.5074, -0.1278, "On or near Strand");
        let b = derive_record_id(&period, "burglary", 51.5074, -0.1278, "On or near Strand");
        let c = derive_record_id(&period, "burglary", 51.5074, -0.1278, "On or near Mall");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let groups: Vec<usize> = a.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert!(a.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn test_parse_street_archive() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("2024-01/2024-01-met-street.csv", STREET_CSV)]));

        let (records, counters) = collect(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(
            counters,
            ParseCounters {
                detected: 3,
                expected: 3,
                duplicates: 0,
                invalid: 0
            }
        );

        let first = &records[0];
        assert_eq!(first.category, "Burglary");
        assert_eq!(first.lat, 51.5074);
        assert_eq!(first.lng, -0.1278);
        assert_eq!(
            first.occurred_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(first.risk_score, None);
        assert_eq!(
            first.hex_res8,
            H3Indexer::new().cell_for(51.5074, -0.1278, 8).unwrap()
        );
        assert!(first.hex_res6.as_str().starts_with("86"));
        assert!(first.hex_res7.as_str().starts_with("87"));
        assert_eq!(first.raw_payload["location"], "On or near Trafalgar Square");
        assert_eq!(first.raw_payload["lsoa_code"], "E01004734");

        assert_eq!(records[2].id, "abc123");
    }

    #[test]
    fn test_counters_for_duplicates_and_invalid_rows() {
        let csv = "Month,Latitude,Longitude,Crime type,Location,Crime ID
2024-01,51.5,-0.1,Burglary,High Street,
2024-01,51.5,-0.1,Burglary,High Street,
January,51.5,-0.1,Burglary,High Street,
2024-01,,-0.1,Burglary,High Street,
2024-01,north,-0.1,Burglary,High Street,
2024-01,51.6,-0.2,,Low Street,
2024-01,51.7,-0.3,Robbery,Mall,X1
2024-01,51.8,-0.4,Robbery,Mall,X1
";
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("a-street.csv", csv)]));

        let (records, counters) = collect(&path);
        assert_eq!(
            counters,
            ParseCounters {
                detected: 8,
                expected: 3,
                duplicates: 2,
                invalid: 3
            }
        );
        assert_eq!(records[1].category, UNKNOWN_CATEGORY);
        assert_eq!(records[2].id, "X1");
        assert_eq!(records[2].lat, 51.7);
    }

    #[test]
    fn test_duplicates_across_entries_are_caught() {
        let csv = "Month,Latitude,Longitude,Crime type,Location\n2024-01,51.5,-0.1,Burglary,High Street\n";
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("a/one-street.csv", csv), ("b/two-street.csv", csv)]));

        let (records, counters) = collect(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(counters.duplicates, 1);
        assert_eq!(counters.detected, 2);
    }

    #[test]
    fn test_parse_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("street.csv", STREET_CSV)]));

        let (first, _) = collect(&path);
        let (second, counters) = collect(&path);
        let first_ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(counters.duplicates, 0);
    }

    #[test]
    fn test_coordinates_rounded_and_aliases_resolved() {
        let csv = "period,lat,lon,category,risk,street
2024-02-14T21:45:00Z,51.12345678,-0.98765432,theft,0.75,Elm Row
2024-02,51.1,-0.9,theft,1.5,Oak Row
";
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("x-street.CSV", csv)]));

        let (records, _) = collect(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lat, 51.123457);
        assert_eq!(records[0].lng, -0.987654);
        assert_eq!(records[0].risk_score, Some(0.75));
        assert_eq!(
            records[0].occurred_at,
            Utc.with_ymd_and_hms(2024, 2, 14, 21, 45, 0).unwrap()
        );
        assert_eq!(records[1].risk_score, None);
        assert_eq!(
            records[1].occurred_at,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut csv = b"Month,Latitude,Longitude,Crime type,Location\n2024-01,51.5,-0.1,Burglary,Caf".to_vec();
        csv.extend_from_slice(&[0xE9, 0xFF]);
        csv.extend_from_slice(b" Street\n");

        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes_raw(&[("a-street.csv", &csv)]));

        let (records, counters) = collect(&path);
        assert_eq!(counters.expected, 1);
        let location = records[0].raw_payload["location"].as_str().unwrap();
        assert!(location.contains('\u{fffd}'));
        assert!(location.starts_with("Caf"));
    }

    #[test]
    fn test_only_street_entries_are_read() {
        let street = "Crime ID,Month,Reported by,Falls within,Longitude,Latitude,Location,LSOA code,LSOA name,Crime type,Last outcome category,Context
abc123,2024-01,Metropolitan Police Service,Metropolitan Police Service,-0.141900,51.501400,On or near Buckingham Gate,E01004736,Westminster 020B,Burglary,Under investigation,
";
        let outcomes = "Crime ID,Month,Reported by,Falls within,Longitude,Latitude,Location,LSOA code,LSOA name,Outcome type
abc123,2024-01,Metropolitan Police Service,Metropolitan Police Service,-0.141900,51.501400,On or near Buckingham Gate,E01004736,Westminster 020B,Investigation complete; no suspect identified
";
        let stop_and_search = "Type,Date,Part of a policing operation,Policing operation,Latitude,Longitude,Gender,Age range,Self-defined ethnicity,Officer-defined ethnicity,Legislation,Object of search,Outcome,Outcome linked to object of search,Removal of more than just outer clothing
Person search,2024-01-05T10:00:00+00:00,False,,51.501400,-0.141900,Male,18-24,,,Misuse of Drugs Act 1971 (section 23),Controlled drugs,A no further action disposal,False,False
";
        let dir = TempDir::new().unwrap();
        let path = write_archive(
            &dir,
            &zip_bytes(&[
                ("2024-01/2024-01-metropolitan-outcomes.csv", outcomes),
                ("2024-01/2024-01-metropolitan-stop-and-search.csv", stop_and_search),
                ("2024-01/2024-01-metropolitan-street.csv", street),
            ]),
        );

        let (records, counters) = collect(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "abc123");
        assert_eq!(records[0].category, "Burglary");
        assert_eq!(
            counters,
            ParseCounters {
                detected: 1,
                expected: 1,
                duplicates: 0,
                invalid: 0
            }
        );
    }

    #[test]
    fn test_event_entry_selection() {
        let mapping = HeaderMapping::default();
        assert!(mapping.is_event_entry("street.csv"));
        assert!(mapping.is_event_entry("2024-01/2024-01-city-of-london-street.csv"));
        assert!(mapping.is_event_entry("2024-01/2024-01-met-STREET.CSV"));
        assert!(!mapping.is_event_entry("2024-01/2024-01-met-outcomes.csv"));
        assert!(!mapping.is_event_entry("2024-01/2024-01-met-stop-and-search.csv"));
        assert!(!mapping.is_event_entry("2024-01/2024-01-met-street.txt"));
        assert!(!mapping.is_event_entry("__MACOSX/2024-01/._2024-01-met-street.csv"));

        let everything = HeaderMapping {
            entry_kinds: Vec::new(),
            ..HeaderMapping::default()
        };
        assert!(everything.is_event_entry("2024-01/2024-01-met-outcomes.csv"));
        assert!(!everything.is_event_entry("notes.txt"));
    }

    #[test]
    fn test_entries_from_other_months_are_skipped() {
        let december = "Month,Latitude,Longitude,Crime type,Location\n2023-12,51.5,-0.1,Burglary,High Street\n";
        let january = "Month,Latitude,Longitude,Crime type,Location\n2024-01,51.6,-0.2,Robbery,Low Street\n";
        let dir = TempDir::new().unwrap();
        let path = write_archive(
            &dir,
            &zip_bytes(&[
                ("2023-12/2023-12-met-street.csv", december),
                ("2024-01/2024-01-met-street.csv", january),
                ("2023-12-city-street.csv", december),
            ]),
        );

        let mut stream = parser()
            .with_period(Period::new(2024, 1).unwrap())
            .parse_archive(&path)
            .unwrap();
        let records: Vec<InsertableRecord> = stream.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, "Robbery");
        assert_eq!(stream.counters().detected, 1);

        let (all, _) = collect(&path);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_archive_without_csv_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("readme.txt", "nothing here")]));
        assert!(matches!(
            parser().parse_archive(&path),
            Err(IngestError::Archive(_))
        ));

        let path = write_archive(&dir, &zip_bytes(&[("2024-01/2024-01-met-outcomes.csv", "Month\n")]));
        assert!(matches!(
            parser().parse_archive(&path),
            Err(IngestError::Archive(_))
        ));
    }

    #[test]
    fn test_cancellation_stops_stream() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("street.csv", STREET_CSV)]));

        let cancel = CancellationToken::new();
        let mut stream = parser()
            .with_cancellation(cancel.clone())
            .parse_archive(&path)
            .unwrap();
        assert!(stream.next().unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(stream.next(), Some(Err(IngestError::Cancelled))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_indexing_failure_ends_stream() {
        struct Unreachable;
        impl HexIndexer for Unreachable {
            fn name(&self) -> &str {
                "unreachable"
            }
            fn cell_for(&self, _: f64, _: f64, _: u8) -> Result<CellId, IndexingError> {
                Err(IndexingError::Unavailable("timed out".to_string()))
            }
            fn boundary_of(&self, _: &CellId) -> Result<Vec<(f64, f64)>, IndexingError> {
                Err(IndexingError::Unavailable("timed out".to_string()))
            }
        }

        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("street.csv", STREET_CSV)]));
        let mut stream = RecordParser::new(Arc::new(Unreachable), HeaderMapping::default())
            .parse_archive(&path)
            .unwrap();
        assert!(matches!(stream.next(), Some(Err(IngestError::Indexing(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_scratch_file_removed() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &zip_bytes(&[("street.csv", STREET_CSV)]));

        let mut stream = parser().parse_archive(&path).unwrap();
        stream.next().unwrap().unwrap();
        drop(stream);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["2024-01.test.zip".to_string()]);
    }
}
