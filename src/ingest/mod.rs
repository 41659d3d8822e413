/// Data collaborators consumed by the spatial feature resolver.
///
/// Each source answers for a single coordinate and reports `SourceError`
/// when it cannot. Implementations must be `Send + Sync`: the resolver
/// queries all of them concurrently from worker threads.
///
/// Submodules:
/// - `iem`: ASOS rainfall from the Iowa Environmental Mesonet archive.
/// - `ledger`: in-memory rainfall ledger fed by manual measurements.

pub mod iem;
pub mod ledger;

use std::fmt;
use std::time::Duration;

use crate::model::Coordinate;

// ---------------------------------------------------------------------------
// Rainfall windows
// ---------------------------------------------------------------------------

/// Accumulation window for rainfall totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RainfallWindow {
    Hours24,
    Hours72,
}

impl RainfallWindow {
    pub fn hours(&self) -> i64 {
        match self {
            RainfallWindow::Hours24 => 24,
            RainfallWindow::Hours72 => 72,
        }
    }
}

impl fmt::Display for RainfallWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.hours())
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Terrain data source.
pub trait TerrainSource: Send + Sync {
    /// Elevation above the sea-level datum, in metres.
    fn elevation(&self, at: &Coordinate) -> Result<f64, SourceError>;
}

/// Spatial water-body layer (rivers, lakes, wetlands).
pub trait WaterBodyLayer: Send + Sync {
    /// Distance to the nearest water body, in metres. Zero on the water body.
    fn nearest_distance(&self, at: &Coordinate) -> Result<f64, SourceError>;
}

/// Rainfall aggregates, recent or forecast.
pub trait RainfallSource: Send + Sync {
    /// Accumulated rainfall over `window`, in millimetres.
    fn rainfall(&self, at: &Coordinate, window: RainfallWindow) -> Result<f64, SourceError>;
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a collaborator could not answer.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The layer has no data covering the location.
    NoData(String),
    /// The lookup did not complete within the resolver's bound.
    Timeout { source: &'static str, after: Duration },
    /// Non-2xx HTTP response from a remote API.
    Http(u16),
    /// Database query or network transport failure.
    Query(String),
    /// A response could not be interpreted.
    Parse(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NoData(msg) => write!(f, "No data: {}", msg),
            SourceError::Timeout { source, after } => {
                write!(f, "{} lookup timed out after {} ms", source, after.as_millis())
            }
            SourceError::Http(code) => write!(f, "HTTP error: {}", code),
            SourceError::Query(msg) => write!(f, "Query error: {}", msg),
            SourceError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<postgres::Error> for SourceError {
    fn from(err: postgres::Error) -> Self {
        SourceError::Query(err.to_string())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SourceError::Http(status.as_u16()),
            None => SourceError::Query(err.to_string()),
        }
    }
}
