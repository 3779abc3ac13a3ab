//! Hex cell aggregation lens
//!
//! Answers "what happened inside this bounding box" by bucketing stored
//! records into hex cells at the requested resolution. Each cell carries a
//! count, a category histogram and risk-score statistics with an optional
//! confidence interval.
//!
//! Cells are always recomputed from the record coordinates at the requested
//! resolution, including 6, 7 and 8, so a query never mixes cells from the
//! stored columns with freshly computed ones.
//!
//! # Example
//!
//! ```rust,ignore
//! use hexstat::database::HexstatDatabase;
//! use hexstat::lens::aggregate::{AggregationEngine, AggregateQuery, AggregateCache};
//!
//! let db = HexstatDatabase::open_in_dir("~/.hexstat")?;
//! let cache = AggregateCache::default();
//! let engine = AggregationEngine::new(&db).with_cache(&cache);
//!
//! let query = AggregateQuery::new("-0.2,51.4,0.0,51.6".parse()?, 7)?;
//! let cells = engine.aggregate_by_bbox(&query)?;
//! ```

mod cache;
mod stats;

pub use cache::{AggregateCache, DEFAULT_CACHE_CAPACITY};
pub use stats::{
    inverse_normal_cdf, z_score, CellStatistics, CellSummary, ConfidenceInterval, HexAggregate,
};

use crate::database::{HexstatDatabase, RecordFilter, RecordPoint};
use crate::error::IndexingError;
use crate::lens::hex::{CellId, ChainedIndexer, HexIndexer, MAX_RESOLUTION};
use crate::lens::time::{TimeLens, TimeOfDay};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Aggregates keyed by cell, in cell order
pub type CellAggregates = BTreeMap<CellId, HexAggregate>;

// =============================================================================
// Types
// =============================================================================

/// WGS84 bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            return Err(anyhow!("Bounding box coordinates must be finite numbers"));
        }
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(anyhow!("Bounding box longitudes must lie within [-180, 180]"));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(anyhow!("Bounding box latitudes must lie within [-90, 90]"));
        }
        if west >= east {
            return Err(anyhow!(
                "Bounding box west ({}) must be less than east ({})",
                west,
                east
            ));
        }
        if south >= north {
            return Err(anyhow!(
                "Bounding box south ({}) must be less than north ({})",
                south,
                north
            ));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }
}

impl FromStr for BoundingBox {
    type Err = anyhow::Error;

    /// Parse `west,south,east,north`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(anyhow!(
                "Bounding box must be 'west,south,east,north', got '{}'",
                s
            ));
        }
        let mut values = [0f64; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            *value = part
                .parse()
                .map_err(|_| anyhow!("Invalid bounding box coordinate '{}'", part))?;
        }
        Self::new(values[0], values[1], values[2], values[3])
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

/// Risk-score band filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Severity {
    /// Risk score in [0, 1/3)
    Low,
    /// Risk score in [1/3, 2/3)
    Medium,
    /// Risk score in [2/3, 1]
    High,
}

impl Severity {
    /// Range of matching risk scores, half-open except for `High`
    pub fn risk_range(&self) -> (f64, f64) {
        match self {
            Severity::Low => (0.0, 1.0 / 3.0),
            Severity::Medium => (1.0 / 3.0, 2.0 / 3.0),
            Severity::High => (2.0 / 3.0, 1.0),
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(anyhow!(
                "Unknown severity '{}', expected low, medium or high",
                other
            )),
        }
    }
}

/// A validated aggregation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateQuery {
    pub bbox: BoundingBox,
    pub resolution: u8,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Ignored when blank or not present in storage
    pub category: Option<String>,
    /// Inclusive `(start, end)` window, wrapping past midnight when start > end
    pub time_of_day: Option<(TimeOfDay, TimeOfDay)>,
    pub severity: Option<Severity>,
    /// Level of the interval to report; `None` omits intervals
    pub confidence_level: Option<f64>,
}

impl AggregateQuery {
    pub fn new(bbox: BoundingBox, resolution: u8) -> Result<Self> {
        if resolution > MAX_RESOLUTION {
            return Err(anyhow!(
                "Resolution must be between 0 and {}, got {}",
                MAX_RESOLUTION,
                resolution
            ));
        }
        Ok(Self {
            bbox,
            resolution,
            from: None,
            to: None,
            category: None,
            time_of_day: None,
            severity: None,
            confidence_level: None,
        })
    }

    /// Key identifying the cells this query produces
    ///
    /// The confidence level only affects rendering, so it is left out.
    pub fn cache_key(&self) -> Result<String> {
        let mut keyed = self.clone();
        keyed.confidence_level = None;
        serde_json::to_string(&keyed).map_err(|e| anyhow!("Failed to serialize query: {}", e))
    }
}

// =============================================================================
// Args
// =============================================================================

/// Arguments for a bounding-box aggregation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct AggregateArgs {
    /// Bounding box as west,south,east,north in degrees
    #[cfg_attr(feature = "cli", clap(long, allow_hyphen_values = true))]
    pub bbox: String,

    /// Grid resolution (0-15)
    #[cfg_attr(feature = "cli", clap(short, long, default_value_t = 8))]
    pub resolution: u8,

    /// Only records at or after this time (RFC3339, unix timestamp or date)
    #[cfg_attr(feature = "cli", clap(long))]
    pub from: Option<String>,

    /// Only records at or before this time
    #[cfg_attr(feature = "cli", clap(long))]
    pub to: Option<String>,

    /// Only records of this category; unknown categories are ignored
    #[cfg_attr(feature = "cli", clap(long))]
    pub category: Option<String>,

    /// Start of the time-of-day window, HH:MM
    #[cfg_attr(feature = "cli", clap(long))]
    pub time_start: Option<String>,

    /// End of the time-of-day window, HH:MM
    #[cfg_attr(feature = "cli", clap(long))]
    pub time_end: Option<String>,

    /// Only records in this risk band
    #[cfg_attr(feature = "cli", clap(long, value_enum))]
    pub severity: Option<Severity>,

    /// Report confidence intervals at the configured level
    #[cfg_attr(feature = "cli", clap(long))]
    pub with_ci: bool,

    /// Report confidence intervals at this level, between 0 and 1
    #[cfg_attr(feature = "cli", clap(long))]
    pub confidence: Option<f64>,
}

impl AggregateArgs {
    /// Validate the arguments into a query
    ///
    /// `default_level` is used when intervals are requested without a level.
    pub fn to_query(&self, default_level: f64) -> Result<AggregateQuery> {
        let bbox: BoundingBox = self.bbox.parse()?;
        let mut query = AggregateQuery::new(bbox, self.resolution)?;

        let (from, to) = TimeLens::new().parse_range(self.from.as_deref(), self.to.as_deref())?;
        query.from = from;
        query.to = to;

        query.category = self
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let start = self.time_start.as_deref().map(str::parse).transpose()?;
        let end = self.time_end.as_deref().map(str::parse).transpose()?;
        query.time_of_day = match (start, end) {
            (None, None) => None,
            (start, end) => Some((
                start.unwrap_or(TimeOfDay::START_OF_DAY),
                end.unwrap_or(TimeOfDay::END_OF_DAY),
            )),
        };

        query.severity = self.severity;

        query.confidence_level = match (self.confidence, self.with_ci) {
            (Some(level), _) => Some(validate_level(level)?),
            (None, true) => Some(validate_level(default_level)?),
            (None, false) => None,
        };

        Ok(query)
    }
}

fn validate_level(level: f64) -> Result<f64> {
    if level.is_finite() && level > 0.0 && level < 1.0 {
        Ok(level)
    } else {
        Err(anyhow!(
            "Confidence level must be between 0 and 1 (exclusive), got {}",
            level
        ))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Bounding-box aggregation over stored records
pub struct AggregationEngine<'a> {
    db: &'a HexstatDatabase,
    indexer: Arc<dyn HexIndexer>,
    cache: Option<&'a AggregateCache>,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(db: &'a HexstatDatabase) -> Self {
        Self {
            db,
            indexer: Arc::new(ChainedIndexer::default()),
            cache: None,
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn HexIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_cache(mut self, cache: &'a AggregateCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Aggregate the records matching `query` per hex cell
    ///
    /// An empty box yields an empty map.
    pub fn aggregate_by_bbox(&self, query: &AggregateQuery) -> Result<CellAggregates> {
        if query.resolution > MAX_RESOLUTION {
            return Err(anyhow!(
                "Resolution must be between 0 and {}, got {}",
                MAX_RESOLUTION,
                query.resolution
            ));
        }

        let generation = self.db.aggregate_generation()?;
        let key = query.cache_key()?;
        if let Some(cache) = self.cache {
            if let Some(cells) = cache.get(&key, generation) {
                debug!("aggregate cache hit at generation {}", generation);
                return Ok(cells.as_ref().clone());
            }
        }

        let points = self.select_points(query)?;
        let cells = bucket_points(self.indexer.as_ref(), &points, query.resolution)
            .map_err(|e| anyhow!("Failed to index records for aggregation: {}", e))?;

        info!(
            "aggregated {} records into {} cells at resolution {}",
            points.len(),
            cells.len(),
            query.resolution
        );

        if let Some(cache) = self.cache {
            cache.insert(key, generation, Arc::new(cells.clone()));
        }
        Ok(cells)
    }

    /// Aggregate and render every cell with its statistics
    pub fn summarize_by_bbox(
        &self,
        query: &AggregateQuery,
    ) -> Result<BTreeMap<CellId, CellSummary>> {
        let cells = self.aggregate_by_bbox(query)?;
        Ok(summarize_cells(&cells, query.confidence_level))
    }

    fn select_points(&self, query: &AggregateQuery) -> Result<Vec<RecordPoint>> {
        let records = self.db.records();

        let category = match query.category.as_deref().map(str::trim) {
            Some(c) if c.is_empty() => None,
            Some(c) if records.category_exists(c)? => Some(c.to_string()),
            Some(c) => {
                debug!("ignoring filter on unknown category '{}'", c);
                None
            }
            None => None,
        };

        let filter = RecordFilter {
            west: query.bbox.west,
            south: query.bbox.south,
            east: query.bbox.east,
            north: query.bbox.north,
            from: query.from,
            to: query.to,
            category,
            risk_range: query.severity.map(|s| s.risk_range()),
        };

        let points = records.query_points(&filter)?;
        Ok(match query.time_of_day {
            Some((start, end)) => points
                .into_iter()
                .filter(|p| TimeOfDay::within(TimeOfDay::of(&p.occurred_at), start, end))
                .collect(),
            None => points,
        })
    }
}

/// Bucket points into cells at `resolution`, in parallel
fn bucket_points(
    indexer: &dyn HexIndexer,
    points: &[RecordPoint],
    resolution: u8,
) -> Result<CellAggregates, IndexingError> {
    let cells = points
        .par_iter()
        .try_fold(
            HashMap::new,
            |mut acc, point| -> Result<HashMap<CellId, HexAggregate>, IndexingError> {
                let cell = indexer.cell_for(point.lat, point.lng, resolution)?;
                acc.entry(cell)
                    .or_default()
                    .add(&point.category, point.risk_score);
                Ok(acc)
            },
        )
        .try_reduce(HashMap::new, |mut acc, other| {
            for (cell, aggregate) in other {
                acc.entry(cell).or_default().merge(aggregate);
            }
            Ok(acc)
        })?;

    Ok(cells.into_iter().collect())
}

pub fn summarize_cells(
    cells: &CellAggregates,
    confidence_level: Option<f64>,
) -> BTreeMap<CellId, CellSummary> {
    cells
        .iter()
        .map(|(cell, aggregate)| (cell.clone(), aggregate.summarize(confidence_level)))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InsertableRecord;
    use crate::lens::hex::H3Indexer;
    use chrono::TimeZone;

    fn record(
        id: &str,
        lat: f64,
        lng: f64,
        category: &str,
        risk: Option<f64>,
        occurred_at: DateTime<Utc>,
    ) -> InsertableRecord {
        let indexer = H3Indexer::new();
        InsertableRecord {
            id: id.to_string(),
            category: category.to_string(),
            occurred_at,
            lat,
            lng,
            hex_res6: indexer.cell_for(lat, lng, 6).unwrap(),
            hex_res7: indexer.cell_for(lat, lng, 7).unwrap(),
            hex_res8: indexer.cell_for(lat, lng, 8).unwrap(),
            risk_score: risk,
            raw_payload: serde_json::json!({}),
            created_at: occurred_at,
            updated_at: occurred_at,
        }
    }

    fn jan(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, hour, minute, 0).unwrap()
    }

    fn london_query(resolution: u8) -> AggregateQuery {
        AggregateQuery::new("-0.2,51.4,0.0,51.6".parse().unwrap(), resolution).unwrap()
    }

    fn seeded_db() -> HexstatDatabase {
        let db = HexstatDatabase::open_in_memory().unwrap();
        db.records()
            .insert_batch(&[
                record("a", 51.5, -0.1, "burglary", Some(0.8), jan(1, 0)),
                record("b", 51.5, -0.1, "burglary", Some(0.4), jan(13, 0)),
                record("c", 51.5, -0.1, "robbery", None, jan(23, 30)),
                record("d", 51.45, -0.15, "theft", Some(0.1), jan(9, 0)),
                record("e", 48.85, 2.35, "burglary", Some(0.9), jan(12, 0)),
            ])
            .unwrap();
        db
    }

    #[test]
    fn test_bounding_box_parse() {
        let bbox: BoundingBox = "-0.2, 51.4, 0.0, 51.6".parse().unwrap();
        assert_eq!(bbox.west, -0.2);
        assert_eq!(bbox.north, 51.6);

        assert!("-0.2,51.4,0.0".parse::<BoundingBox>().is_err());
        assert!("0.0,51.4,-0.2,51.6".parse::<BoundingBox>().is_err());
        assert!("-0.2,51.6,0.0,51.4".parse::<BoundingBox>().is_err());
        assert!("-0.2,51.4,0.0,91".parse::<BoundingBox>().is_err());
        assert!("-181,51.4,0.0,51.6".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::Low.risk_range(), (0.0, 1.0 / 3.0));
        assert_eq!(Severity::High.risk_range(), (2.0 / 3.0, 1.0));
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("extreme".parse::<Severity>().is_err());
    }

    #[test]
    fn test_args_to_query() {
        let args = AggregateArgs {
            bbox: "-0.2,51.4,0.0,51.6".to_string(),
            resolution: 7,
            from: Some("2024-01-01T00:00:00Z".to_string()),
            to: Some("2024-02-01T00:00:00Z".to_string()),
            category: Some("  ".to_string()),
            time_start: Some("22:00".to_string()),
            with_ci: true,
            ..Default::default()
        };
        let query = args.to_query(0.9).unwrap();
        assert_eq!(query.resolution, 7);
        assert!(query.from.is_some() && query.to.is_some());
        assert_eq!(query.category, None);
        assert_eq!(
            query.time_of_day,
            Some(("22:00".parse().unwrap(), TimeOfDay::END_OF_DAY))
        );
        assert_eq!(query.confidence_level, Some(0.9));

        let whole_day = AggregateArgs {
            to: Some("2024-01-31".to_string()),
            ..args.clone()
        };
        assert_eq!(
            whole_day.to_query(0.9).unwrap().to,
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap())
        );

        let bad_level = AggregateArgs {
            confidence: Some(1.0),
            ..args.clone()
        };
        assert!(bad_level.to_query(0.95).is_err());

        let bad_resolution = AggregateArgs {
            resolution: 16,
            ..args.clone()
        };
        assert!(bad_resolution.to_query(0.95).is_err());

        let inverted = AggregateArgs {
            from: Some("2024-03-01T00:00:00Z".to_string()),
            ..args
        };
        assert!(inverted.to_query(0.95).is_err());
    }

    #[test]
    fn test_single_record_scenario() {
        let db = HexstatDatabase::open_in_memory().unwrap();
        db.records()
            .insert_batch(&[record("only", 51.5, -0.1, "burglary", Some(0.8), jan(12, 0))])
            .unwrap();

        let cells = AggregationEngine::new(&db)
            .aggregate_by_bbox(&london_query(7))
            .unwrap();
        assert_eq!(cells.len(), 1);

        let (cell, aggregate) = cells.iter().next().unwrap();
        assert_eq!(*cell, H3Indexer::new().cell_for(51.5, -0.1, 7).unwrap());
        assert_eq!(aggregate.count, 1);
        assert_eq!(aggregate.categories.len(), 1);
        assert_eq!(aggregate.categories.get("burglary"), Some(&1));
        assert_eq!(aggregate.mean_risk_score(), Some(0.8));
    }

    #[test]
    fn test_aggregate_groups_by_cell() {
        let db = seeded_db();
        let cells = AggregationEngine::new(&db)
            .aggregate_by_bbox(&london_query(8))
            .unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells.values().map(|a| a.count).sum::<u64>(), 4);

        let central = cells
            .get(&H3Indexer::new().cell_for(51.5, -0.1, 8).unwrap())
            .unwrap();
        assert_eq!(central.count, 3);
        assert_eq!(central.categories.get("burglary"), Some(&2));
        assert_eq!(central.categories.get("robbery"), Some(&1));
        assert_eq!(central.risk_value_count, 2);
        assert!((central.mean_risk_score().unwrap() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_arbitrary_resolution() {
        let db = seeded_db();
        let engine = AggregationEngine::new(&db);
        let coarse = engine.aggregate_by_bbox(&london_query(0)).unwrap();
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse.values().next().unwrap().count, 4);

        let fine = engine.aggregate_by_bbox(&london_query(12)).unwrap();
        assert_eq!(fine.len(), 2);
        assert!(fine.keys().all(|c| c.as_str().starts_with("8c")));
    }

    #[test]
    fn test_empty_box_is_empty_map() {
        let db = seeded_db();
        let query = AggregateQuery::new("100,10,101,11".parse().unwrap(), 7).unwrap();
        assert!(AggregationEngine::new(&db)
            .aggregate_by_bbox(&query)
            .unwrap()
            .is_empty());

        let empty_db = HexstatDatabase::open_in_memory().unwrap();
        assert!(AggregationEngine::new(&empty_db)
            .aggregate_by_bbox(&london_query(7))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_category_filter_and_unknown_category() {
        let db = seeded_db();
        let engine = AggregationEngine::new(&db);

        let mut query = london_query(6);
        query.category = Some("burglary".to_string());
        let cells = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(cells.values().map(|a| a.count).sum::<u64>(), 2);

        query.category = Some("arson".to_string());
        let cells = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(cells.values().map(|a| a.count).sum::<u64>(), 4);
    }

    #[test]
    fn test_time_filters() {
        let db = seeded_db();
        let engine = AggregationEngine::new(&db);

        let mut query = london_query(6);
        query.time_of_day = Some(("22:00".parse().unwrap(), "02:00".parse().unwrap()));
        let cells = engine.aggregate_by_bbox(&query).unwrap();
        let total: u64 = cells.values().map(|a| a.count).sum();
        assert_eq!(total, 2);

        let mut query = london_query(6);
        query.from = Some(jan(10, 0));
        query.to = Some(jan(14, 0));
        let cells = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(cells.values().map(|a| a.count).sum::<u64>(), 1);
    }

    #[test]
    fn test_severity_filter_skips_unscored() {
        let db = seeded_db();
        let mut query = london_query(6);
        query.severity = Some(Severity::High);
        let cells = AggregationEngine::new(&db).aggregate_by_bbox(&query).unwrap();
        let aggregate = cells.values().next().unwrap();
        assert_eq!(aggregate.count, 1);
        assert_eq!(aggregate.mean_risk_score(), Some(0.8));

        query.severity = Some(Severity::Low);
        let cells = AggregationEngine::new(&db).aggregate_by_bbox(&query).unwrap();
        assert_eq!(cells.values().map(|a| a.count).sum::<u64>(), 1);
    }

    #[test]
    fn test_cache_invalidated_by_insert() {
        let db = seeded_db();
        let cache = AggregateCache::default();
        let engine = AggregationEngine::new(&db).with_cache(&cache);
        let query = london_query(6);

        let first = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(cache.len(), 1);
        let again = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(first, again);

        db.records()
            .insert_batch(&[record("f", 51.5, -0.1, "burglary", None, jan(8, 0))])
            .unwrap();
        let fresh = engine.aggregate_by_bbox(&query).unwrap();
        assert_eq!(fresh.values().map(|a| a.count).sum::<u64>(), 5);

        // re-inserting an existing id leaves the generation and cache alone
        db.records()
            .insert_batch(&[record("f", 51.5, -0.1, "burglary", None, jan(8, 0))])
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(engine.aggregate_by_bbox(&query).unwrap(), fresh);
    }

    #[test]
    fn test_summaries_carry_intervals_on_request() {
        let db = seeded_db();
        let engine = AggregationEngine::new(&db);

        let mut query = london_query(8);
        let plain = engine.summarize_by_bbox(&query).unwrap();
        assert!(plain
            .values()
            .all(|s| s.statistics.confidence_interval.is_none()));

        query.confidence_level = Some(0.95);
        let with_ci = engine.summarize_by_bbox(&query).unwrap();
        for summary in with_ci.values() {
            let mean = summary.statistics.mean_risk_score.unwrap();
            let ci = summary.statistics.confidence_interval.unwrap();
            assert!(ci.lower <= mean && mean <= ci.upper);
        }
    }

    #[test]
    fn test_cache_key_ignores_confidence_level() {
        let mut a = london_query(7);
        let mut b = london_query(7);
        a.confidence_level = Some(0.9);
        b.confidence_level = Some(0.99);
        assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());
        b.resolution = 8;
        assert_ne!(a.cache_key().unwrap(), b.cache_key().unwrap());
    }
}
