/// Core data types for the flood risk service.
///
/// This module defines the shared domain model imported by all other modules:
/// locations, feature vectors, risk scores, zones, alerts and the error
/// taxonomy. It contains validation but no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Mean Earth radius used for great-circle distances, in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 point. Only constructible through `Coordinate::new`, so every
/// value in circulation is within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = FloodRiskError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, FloodRiskError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(FloodRiskError::InvalidInput(format!(
                "latitude {} is outside [-90, 90]",
                latitude
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(FloodRiskError::InvalidInput(format!(
                "longitude {} is outside [-180, 180]",
                longitude
            )));
        }
        Ok(Coordinate { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle (haversine) distance to `other`, in metres.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Maximum length of a region identifier.
pub const MAX_REGION_ID_LEN: usize = 64;

/// Identifier of a monitored region, e.g. "nsanje" or "MW-SO-04".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegionId(String);

impl RegionId {
    pub fn parse(raw: &str) -> Result<Self, FloodRiskError> {
        let well_formed = !raw.is_empty()
            && raw.len() <= MAX_REGION_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if well_formed {
            Ok(RegionId(raw.to_string()))
        } else {
            Err(FloodRiskError::InvalidInput(format!(
                "malformed region id '{}'",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RegionId {
    type Error = FloodRiskError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        RegionId::parse(&raw)
    }
}

impl From<RegionId> for String {
    fn from(id: RegionId) -> Self {
        id.0
    }
}

impl FromStr for RegionId {
    type Err = FloodRiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegionId::parse(s)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a risk computation is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Point(Coordinate),
    Region(RegionId),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Point(c) => write!(f, "{}", c),
            Location::Region(id) => write!(f, "{}", id),
        }
    }
}

// ---------------------------------------------------------------------------
// Feature vector
// ---------------------------------------------------------------------------

/// Snapshot of the spatial and environmental inputs for one location.
///
/// A `None` field means the input could not be resolved. It is never
/// interpreted as zero, so the scorer can renormalize over what is known.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Height above the sea-level datum. Negative values are valid.
    pub elevation_m: Option<f64>,
    pub water_distance_m: Option<f64>,
    pub rainfall_mm_24h: Option<f64>,
    pub rainfall_mm_72h: Option<f64>,
}

impl FeatureVector {
    /// Checks the field invariants: every present value finite, distances
    /// and rainfall non-negative.
    pub fn validate(&self) -> Result<(), FloodRiskError> {
        let checks = [
            ("elevation_m", self.elevation_m, true),
            ("water_distance_m", self.water_distance_m, false),
            ("rainfall_mm_24h", self.rainfall_mm_24h, false),
            ("rainfall_mm_72h", self.rainfall_mm_72h, false),
        ];
        for (name, value, allow_negative) in checks {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(FloodRiskError::InvalidInput(format!(
                        "{} is not a finite number",
                        name
                    )));
                }
                if !allow_negative && v < 0.0 {
                    return Err(FloodRiskError::InvalidInput(format!(
                        "{} must be non-negative, got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn has_rainfall(&self) -> bool {
        self.rainfall_mm_24h.is_some() || self.rainfall_mm_72h.is_some()
    }

    /// Number of present features out of the three scored ones
    /// (elevation, water proximity, rainfall).
    pub fn present_features(&self) -> usize {
        [
            self.elevation_m.is_some(),
            self.water_distance_m.is_some(),
            self.has_rainfall(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

// ---------------------------------------------------------------------------
// Risk score
// ---------------------------------------------------------------------------

/// Per-feature sub-scores in [0, 1]; `None` where the feature was absent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubScores {
    pub elevation: Option<f64>,
    pub water_proximity: Option<f64>,
    pub rainfall: Option<f64>,
}

/// Output of the scoring engine. Immutable once built: a re-score produces a
/// new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    value: f64,
    confidence: f64,
    computed_at: DateTime<Utc>,
    inputs: FeatureVector,
    components: SubScores,
}

impl RiskScore {
    pub(crate) fn new(
        value: f64,
        confidence: f64,
        computed_at: DateTime<Utc>,
        inputs: FeatureVector,
        components: SubScores,
    ) -> Self {
        RiskScore {
            value,
            confidence,
            computed_at,
            inputs,
            components,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn inputs(&self) -> &FeatureVector {
        &self.inputs
    }

    pub fn components(&self) -> &SubScores {
        &self.components
    }
}

// ---------------------------------------------------------------------------
// Tiers and zones
// ---------------------------------------------------------------------------

/// Discrete flood risk classification, in ascending order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Moderate,
    High,
    Severe,
}

impl RiskTier {
    pub const ALL: [RiskTier; 4] = [
        RiskTier::Low,
        RiskTier::Moderate,
        RiskTier::High,
        RiskTier::Severe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Moderate => "moderate",
            RiskTier::High => "high",
            RiskTier::Severe => "severe",
        }
    }

    /// Public-facing guidance for the tier.
    pub fn description(&self) -> &'static str {
        match self {
            RiskTier::Low => "Low flood risk",
            RiskTier::Moderate => "Moderate flood risk - monitor conditions",
            RiskTier::High => "High flood risk - stay alert and prepared",
            RiskTier::Severe => "Severe flood risk - immediate action required",
        }
    }

    /// HIGH and SEVERE open alerts.
    pub fn is_alerting(&self) -> bool {
        *self >= RiskTier::High
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for RiskTier {
    type Err = FloodRiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskTier::Low),
            "moderate" => Ok(RiskTier::Moderate),
            "high" => Ok(RiskTier::High),
            "severe" => Ok(RiskTier::Severe),
            other => Err(FloodRiskError::InvalidInput(format!(
                "unknown risk tier '{}'",
                other
            ))),
        }
    }
}

/// The committed risk state of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskZone {
    pub region_id: RegionId,
    pub tier: RiskTier,
    pub current_score: RiskScore,
    pub tier_since: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub u64);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Escalated,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Escalated => "escalated",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// One committed tier change seen while an alert was open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTransition {
    /// `None` for the transition that opened the alert.
    pub from: Option<RiskTier>,
    pub to: RiskTier,
    pub status: AlertStatus,
    pub at: DateTime<Utc>,
}

/// A high-risk episode for one region.
///
/// Fields are read-only outside the crate; only the alert manager appends to
/// the history, and never after the alert is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    id: AlertId,
    region_id: RegionId,
    tier_at_open: RiskTier,
    current_tier: RiskTier,
    status: AlertStatus,
    opened_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    history: Vec<TierTransition>,
}

impl Alert {
    pub(crate) fn open(id: AlertId, region_id: RegionId, tier: RiskTier, at: DateTime<Utc>) -> Self {
        Alert {
            id,
            region_id,
            tier_at_open: tier,
            current_tier: tier,
            status: AlertStatus::Active,
            opened_at: at,
            resolved_at: None,
            history: vec![TierTransition {
                from: None,
                to: tier,
                status: AlertStatus::Active,
                at,
            }],
        }
    }

    /// Appends a tier change. Returns `false` (and changes nothing) once the
    /// alert is resolved.
    pub(crate) fn record(&mut self, to: RiskTier, status: AlertStatus, at: DateTime<Utc>) -> bool {
        if self.status == AlertStatus::Resolved {
            return false;
        }
        self.history.push(TierTransition {
            from: Some(self.current_tier),
            to,
            status,
            at,
        });
        self.current_tier = to;
        self.status = status;
        if status == AlertStatus::Resolved {
            self.resolved_at = Some(at);
        }
        true
    }

    pub fn id(&self) -> AlertId {
        self.id
    }

    pub fn region_id(&self) -> &RegionId {
        &self.region_id
    }

    pub fn tier_at_open(&self) -> RiskTier {
        self.tier_at_open
    }

    pub fn current_tier(&self) -> RiskTier {
        self.current_tier
    }

    pub fn status(&self) -> AlertStatus {
        self.status
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    pub fn history(&self) -> &[TierTransition] {
        &self.history
    }

    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// Emitted on every alert status transition, for notification collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: AlertId,
    pub region_id: RegionId,
    /// Status before the transition; `None` when the region had no alert.
    pub old_status: Option<AlertStatus>,
    pub new_status: AlertStatus,
    pub tier: RiskTier,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by the risk engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FloodRiskError {
    /// No usable input could be resolved for the location.
    DataUnavailable(String),
    /// Rejected before scoring: out-of-bounds coordinate, negative rainfall,
    /// malformed or unknown region id.
    InvalidInput(String),
    /// The zone store could not be reached; the commit must be retried.
    StorageUnavailable(String),
}

impl fmt::Display for FloodRiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloodRiskError::DataUnavailable(msg) => write!(f, "Data unavailable: {}", msg),
            FloodRiskError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            FloodRiskError::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
        }
    }
}

impl std::error::Error for FloodRiskError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
