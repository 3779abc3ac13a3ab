//! Hexagonal grid indexing lens
//!
//! Converts geographic coordinates into stable hex cell identifiers and cell
//! identifiers back into boundary polygons. Callers depend on the
//! [`HexIndexer`] trait only; [`H3Indexer`] is the in-process backend built
//! on `h3o`, and [`ChainedIndexer`] tries several backends in order so a
//! renamed or relocated backend can be swapped in without touching callers.
//!
//! Boundaries are returned as **open** rings of `(lng, lat)` pairs: the first
//! vertex is not repeated at the end.

use crate::error::IndexingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Resolutions precomputed for every stored record
pub const STORED_RESOLUTIONS: [u8; 3] = [6, 7, 8];

/// Finest resolution of the H3 grid
pub const MAX_RESOLUTION: u8 = 15;

// =============================================================================
// Types
// =============================================================================

/// Hex cell identifier (lowercase hexadecimal H3 index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Validate and normalise a cell identifier
    pub fn new(id: impl AsRef<str>) -> Result<Self, IndexingError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(IndexingError::Malformed("empty cell identifier".to_string()));
        }
        if id.len() > 16 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IndexingError::Malformed(format!(
                "'{}' is not a hexadecimal cell identifier",
                id
            )));
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CellId {
    type Err = IndexingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Cell lookup result for display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "display", derive(tabled::Tabled))]
pub struct HexCellInfo {
    pub cell: String,
    pub resolution: u8,
    pub lat: f64,
    pub lng: f64,
}

/// Cell boundary for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HexBoundary {
    pub cell: String,
    /// Open ring of `[lng, lat]` vertices
    pub vertices: Vec<[f64; 2]>,
}

impl HexBoundary {
    /// GeoJSON polygon geometry (closed ring, as GeoJSON requires)
    pub fn to_geojson(&self) -> serde_json::Value {
        let mut ring = self.vertices.clone();
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [ring],
        })
    }
}

// =============================================================================
// Indexers
// =============================================================================

/// Contract of a hex grid backend
pub trait HexIndexer: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    /// Cell containing the coordinate at the given resolution
    fn cell_for(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId, IndexingError>;

    /// Open boundary ring of `(lng, lat)` vertices
    fn boundary_of(&self, cell: &CellId) -> Result<Vec<(f64, f64)>, IndexingError>;
}

/// In-process H3 backend
#[derive(Debug, Clone, Copy, Default)]
pub struct H3Indexer;

impl H3Indexer {
    pub fn new() -> Self {
        Self
    }
}

impl HexIndexer for H3Indexer {
    fn name(&self) -> &str {
        "h3o"
    }

    fn cell_for(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId, IndexingError> {
        let res = h3o::Resolution::try_from(resolution).map_err(|_| {
            IndexingError::Malformed(format!(
                "resolution {} is outside 0..={}",
                resolution, MAX_RESOLUTION
            ))
        })?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(IndexingError::Malformed(format!(
                "coordinate ({}, {}) is out of range",
                lat, lng
            )));
        }
        let coord = h3o::LatLng::new(lat, lng).map_err(|e| {
            IndexingError::Malformed(format!("invalid coordinate ({}, {}): {}", lat, lng, e))
        })?;

        CellId::new(coord.to_cell(res).to_string())
    }

    fn boundary_of(&self, cell: &CellId) -> Result<Vec<(f64, f64)>, IndexingError> {
        let index = h3o::CellIndex::from_str(cell.as_str())
            .map_err(|e| IndexingError::Malformed(format!("invalid cell '{}': {}", cell, e)))?;

        let ring: Vec<(f64, f64)> = index
            .boundary()
            .iter()
            .map(|vertex| (vertex.lng(), vertex.lat()))
            .collect();

        if ring.len() < 3 {
            return Err(IndexingError::Malformed(format!(
                "cell '{}' has a degenerate boundary",
                cell
            )));
        }
        Ok(ring)
    }
}

/// Tries each backend in order
///
/// Moves on to the next backend only when one reports
/// [`IndexingError::Unavailable`]. A malformed input fails immediately since
/// no other backend would accept it either.
#[derive(Clone)]
pub struct ChainedIndexer {
    backends: Vec<Arc<dyn HexIndexer>>,
}

impl ChainedIndexer {
    pub fn new(backends: Vec<Arc<dyn HexIndexer>>) -> Self {
        Self { backends }
    }

    fn try_each<T>(
        &self,
        op: impl Fn(&dyn HexIndexer) -> Result<T, IndexingError>,
    ) -> Result<T, IndexingError> {
        let mut last_unavailable = None;

        for backend in &self.backends {
            match op(backend.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("hex backend {} failed: {}", backend.name(), e);
                    last_unavailable = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_unavailable.unwrap_or_else(|| {
            IndexingError::Unavailable("no hex indexing backend configured".to_string())
        }))
    }
}

impl Default for ChainedIndexer {
    fn default() -> Self {
        Self::new(vec![Arc::new(H3Indexer::new())])
    }
}

impl HexIndexer for ChainedIndexer {
    fn name(&self) -> &str {
        "chain"
    }

    fn cell_for(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId, IndexingError> {
        self.try_each(|b| b.cell_for(lat, lng, resolution))
    }

    fn boundary_of(&self, cell: &CellId) -> Result<Vec<(f64, f64)>, IndexingError> {
        self.try_each(|b| b.boundary_of(cell))
    }
}

// =============================================================================
// Args
// =============================================================================

/// Arguments for a cell lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct HexCellArgs {
    /// Latitude in degrees
    #[cfg_attr(feature = "cli", clap(long, allow_hyphen_values = true))]
    pub lat: f64,

    /// Longitude in degrees
    #[cfg_attr(feature = "cli", clap(long, allow_hyphen_values = true))]
    pub lng: f64,

    /// Grid resolution (0-15)
    #[cfg_attr(feature = "cli", clap(short, long, default_value_t = 8))]
    pub resolution: u8,
}

// =============================================================================
// Lens
// =============================================================================

/// Hex grid lookups for operators
pub struct HexLens {
    indexer: Arc<dyn HexIndexer>,
}

impl HexLens {
    pub fn new(indexer: Arc<dyn HexIndexer>) -> Self {
        Self { indexer }
    }

    pub fn cell(&self, args: &HexCellArgs) -> Result<HexCellInfo, IndexingError> {
        let cell = self.indexer.cell_for(args.lat, args.lng, args.resolution)?;
        Ok(HexCellInfo {
            cell: cell.to_string(),
            resolution: args.resolution,
            lat: args.lat,
            lng: args.lng,
        })
    }

    pub fn boundary(&self, cell: &str) -> Result<HexBoundary, IndexingError> {
        let cell = CellId::new(cell)?;
        let ring = self.indexer.boundary_of(&cell)?;
        Ok(HexBoundary {
            cell: cell.to_string(),
            vertices: ring.into_iter().map(|(lng, lat)| [lng, lat]).collect(),
        })
    }
}

impl Default for HexLens {
    fn default() -> Self {
        Self::new(Arc::new(ChainedIndexer::default()))
    }
}

// =============================================================================
// Tests
// =============================================================================
