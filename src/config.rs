//! Service configuration.
//!
//! Everything tunable per deployment (feature weights, normalization limits,
//! tier cutoffs, debounce window, lookup timeouts) lives in one TOML file.
//! Every section is optional; missing values fall back to the defaults
//! documented on each field.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::time::Duration;

use crate::logging::LogLevel;

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Weights of the three sub-scores in the final score. Renormalized over the
/// features that are present, so they need not sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub elevation: f64,
    pub water_proximity: f64,
    pub rainfall: f64,
    /// Share of the 24h window within the rainfall sub-score.
    pub rainfall_24h: f64,
    /// Share of the 72h window within the rainfall sub-score.
    pub rainfall_72h: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            elevation: 0.3,
            water_proximity: 0.3,
            rainfall: 0.4,
            rainfall_24h: 0.6,
            rainfall_72h: 0.4,
        }
    }
}

/// Limits of the linear normalization curves.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Elevation at or above which the elevation sub-score is 0.
    pub elevation_ceiling_m: f64,
    /// Distance at or beyond which a water body no longer contributes.
    pub water_influence_m: f64,
    /// 24h rainfall at which the 24h component saturates.
    pub extreme_rainfall_24h_mm: f64,
    /// 72h rainfall at which the 72h component saturates.
    pub extreme_rainfall_72h_mm: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        NormalizationConfig {
            elevation_ceiling_m: 500.0,
            water_influence_m: 2_000.0,
            extreme_rainfall_24h_mm: 100.0,
            extreme_rainfall_72h_mm: 200.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub normalization: NormalizationConfig,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Lower bounds (inclusive) of each tier above LOW.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub moderate: f64,
    pub high: f64,
    pub severe: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        TierThresholds {
            moderate: 0.25,
            high: 0.5,
            severe: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Consecutive readings a new tier must persist before it is committed.
    pub consecutive_readings: u32,
    /// Alternatively commit once the pending tier has lasted this long.
    pub min_dwell_minutes: Option<u64>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            consecutive_readings: 3,
            min_dwell_minutes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Upper bound on each terrain / water / rainfall lookup.
    pub source_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            source_timeout_ms: 5_000,
        }
    }
}

impl ResolverConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RainfallProvider {
    /// Gauge measurements in the PostgreSQL `rainfall_data` table.
    #[default]
    Database,
    /// ASOS precipitation from the Iowa Environmental Mesonet.
    Iem,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RainfallConfig {
    pub provider: RainfallProvider,
    /// Gauges or ASOS stations farther than this from a region are ignored.
    pub max_station_distance_m: f64,
}

impl Default for RainfallConfig {
    fn default() -> Self {
        RainfallConfig {
            provider: RainfallProvider::Database,
            max_station_distance_m: 50_000.0,
        }
    }
}

/// Everything the engine itself needs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub tiers: TierThresholds,
    pub debounce: DebounceConfig,
    pub resolver: ResolverConfig,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub file: Option<String>,
    pub console_timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            file: None,
            console_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between evaluation passes.
    pub interval_secs: u64,
    /// Zones older than this are re-scored first and flagged in the log.
    pub stale_after_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            interval_secs: 900, // 15 minutes
            stale_after_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub rainfall: RainfallConfig,
    pub logging: LoggingConfig,
    pub schedule: ScheduleConfig,
    pub regions_file: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            engine: EngineConfig::default(),
            rainfall: RainfallConfig::default(),
            logging: LoggingConfig::default(),
            schedule: ScheduleConfig::default(),
            regions_file: "regions.toml".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "Cannot read {}: {}", path, source),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

/// Reads and validates the service configuration at `path`.
pub fn load_config(path: &str) -> Result<ServiceConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig =
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.engine.validate()?;
    if !(config.rainfall.max_station_distance_m > 0.0) {
        return Err(ConfigError::Invalid(
            "rainfall.max_station_distance_m must be positive".to_string(),
        ));
    }
    if config.schedule.interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "schedule.interval_secs must be positive".to_string(),
        ));
    }
    Ok(config)
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.scoring.weights;
        let weights = [
            ("elevation", w.elevation),
            ("water_proximity", w.water_proximity),
            ("rainfall", w.rainfall),
            ("rainfall_24h", w.rainfall_24h),
            ("rainfall_72h", w.rainfall_72h),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "weight '{}' must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }
        // Each single feature must be able to carry the score on its own
        // when the others are absent.
        if w.elevation == 0.0 || w.water_proximity == 0.0 || w.rainfall == 0.0 {
            return Err(ConfigError::Invalid(
                "feature weights must all be positive".to_string(),
            ));
        }
        if w.rainfall_24h + w.rainfall_72h <= 0.0 {
            return Err(ConfigError::Invalid(
                "rainfall window weights must not both be zero".to_string(),
            ));
        }

        let n = &self.scoring.normalization;
        let limits = [
            ("elevation_ceiling_m", n.elevation_ceiling_m),
            ("water_influence_m", n.water_influence_m),
            ("extreme_rainfall_24h_mm", n.extreme_rainfall_24h_mm),
            ("extreme_rainfall_72h_mm", n.extreme_rainfall_72h_mm),
        ];
        for (name, limit) in limits {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "normalization '{}' must be positive, got {}",
                    name, limit
                )));
            }
        }

        let t = &self.tiers;
        let ascending = 0.0 < t.moderate && t.moderate < t.high && t.high < t.severe && t.severe <= 1.0;
        if !ascending {
            return Err(ConfigError::Invalid(format!(
                "tier thresholds must satisfy 0 < moderate < high < severe <= 1, got {} / {} / {}",
                t.moderate, t.high, t.severe
            )));
        }

        if self.debounce.consecutive_readings == 0 {
            return Err(ConfigError::Invalid(
                "debounce.consecutive_readings must be at least 1".to_string(),
            ));
        }
        if self.resolver.source_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "resolver.source_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = parse_config("").expect("empty config should use defaults");
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.engine.tiers.moderate, 0.25);
        assert_eq!(config.engine.debounce.consecutive_readings, 3);
        assert_eq!(config.engine.scoring.weights.rainfall, 0.4);
    }

    #[test]
    fn test_partial_sections_override_only_named_fields() {
        let text = r#"
            regions_file = "config/malawi.toml"

            [tiers]
            severe = 0.8

            [debounce]
            consecutive_readings = 2
            min_dwell_minutes = 45

            [scoring.normalization]
            extreme_rainfall_24h_mm = 80.0

            [rainfall]
            provider = "iem"

            [logging]
            level = "debug"
        "#;
        let config = parse_config(text).expect("valid config");
        assert_eq!(config.regions_file, "config/malawi.toml");
        assert_eq!(config.engine.tiers.severe, 0.8);
        assert_eq!(config.engine.tiers.high, 0.5);
        assert_eq!(config.engine.debounce.min_dwell_minutes, Some(45));
        assert_eq!(config.engine.scoring.normalization.extreme_rainfall_24h_mm, 80.0);
        assert_eq!(config.engine.scoring.normalization.water_influence_m, 2_000.0);
        assert_eq!(config.rainfall.provider, RainfallProvider::Iem);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = parse_config(include_str!("../flood_risk.toml")).expect("shipped config parses");
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_non_positive_station_distance_is_rejected() {
        let text = "[rainfall]\nmax_station_distance_m = 0.0\n";
        assert!(matches!(parse_config(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_ascending_thresholds_are_rejected() {
        let text = "[tiers]\nmoderate = 0.5\nhigh = 0.5\nsevere = 0.75\n";
        assert!(matches!(parse_config(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_debounce_is_rejected() {
        let text = "[debounce]\nconsecutive_readings = 0\n";
        assert!(matches!(parse_config(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_weight_is_rejected() {
        let text = "[scoring.weights]\nelevation = -0.1\n";
        assert!(matches!(parse_config(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(parse_config("[tiers"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        assert!(matches!(
            load_config("/nonexistent/flood_risk.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
