//! Risk scoring.
//!
//! Each present feature is mapped to a sub-score in [0, 1] by a linear,
//! clamped, monotonic curve:
//!
//! - elevation: `1 - elevation / ceiling`, 1.0 at or below the datum
//! - water proximity: `1 - distance / influence radius`, 1.0 on the water
//! - rainfall: `w24 * min(r24 / extreme24, 1) + w72 * min(r72 / extreme72, 1)`
//!
//! The final score is the weighted mean of the present sub-scores and the
//! confidence is the fraction of the three features that were present.
//! Nothing here reads the clock: `computed_at` is supplied by the caller, so
//! identical inputs always produce identical scores.

use chrono::{DateTime, Utc};

use crate::config::{NormalizationConfig, ScoringConfig, ScoringWeights};
use crate::model::{FeatureVector, FloodRiskError, RiskScore, SubScores};

/// Number of scored features (elevation, water proximity, rainfall).
pub const FEATURE_COUNT: usize = 3;

// ---------------------------------------------------------------------------
// Normalization curves
// ---------------------------------------------------------------------------

/// Lower ground scores higher. Anything at or below the datum is maximal.
pub fn elevation_subscore(elevation_m: f64, ceiling_m: f64) -> f64 {
    if elevation_m <= 0.0 {
        return 1.0;
    }
    (1.0 - elevation_m / ceiling_m).clamp(0.0, 1.0)
}

/// Closer water scores higher. On the water body itself the score is maximal.
pub fn proximity_subscore(distance_m: f64, influence_m: f64) -> f64 {
    (1.0 - distance_m / influence_m).clamp(0.0, 1.0)
}

/// Saturating share of an extreme rainfall total.
fn saturating_share(amount_mm: f64, extreme_mm: f64) -> f64 {
    (amount_mm / extreme_mm).clamp(0.0, 1.0)
}

/// Combined 24h/72h rainfall sub-score, renormalized when only one window
/// is known. `None` when neither is.
pub fn rainfall_subscore(
    rainfall_24h_mm: Option<f64>,
    rainfall_72h_mm: Option<f64>,
    normalization: &NormalizationConfig,
    weights: &ScoringWeights,
) -> Option<f64> {
    let parts = [
        rainfall_24h_mm.map(|r| {
            (
                weights.rainfall_24h,
                saturating_share(r, normalization.extreme_rainfall_24h_mm),
            )
        }),
        rainfall_72h_mm.map(|r| {
            (
                weights.rainfall_72h,
                saturating_share(r, normalization.extreme_rainfall_72h_mm),
            )
        }),
    ];
    weighted_mean(parts.iter().flatten().copied())
}

/// Weighted mean over `(weight, value)` pairs; `None` when the total weight
/// is zero.
fn weighted_mean(parts: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let (weighted, total) = parts.fold((0.0, 0.0), |(acc, total), (w, v)| (acc + w * v, total + w));
    if total > 0.0 {
        Some((weighted / total).clamp(0.0, 1.0))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RiskScorer {
    config: ScoringConfig,
}

impl RiskScorer {
    pub fn new(config: ScoringConfig) -> Self {
        RiskScorer { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Sub-scores for whatever features are present.
    pub fn components(&self, features: &FeatureVector) -> SubScores {
        let n = &self.config.normalization;
        SubScores {
            elevation: features
                .elevation_m
                .map(|e| elevation_subscore(e, n.elevation_ceiling_m)),
            water_proximity: features
                .water_distance_m
                .map(|d| proximity_subscore(d, n.water_influence_m)),
            rainfall: rainfall_subscore(
                features.rainfall_mm_24h,
                features.rainfall_mm_72h,
                n,
                &self.config.weights,
            ),
        }
    }

    /// Scores a feature vector.
    ///
    /// Fails with `InvalidInput` if the vector breaks its invariants and with
    /// `DataUnavailable` if no feature is present.
    pub fn score(
        &self,
        features: &FeatureVector,
        computed_at: DateTime<Utc>,
    ) -> Result<RiskScore, FloodRiskError> {
        features.validate()?;

        let present = features.present_features();
        if present == 0 {
            return Err(FloodRiskError::DataUnavailable(
                "no features present to score".to_string(),
            ));
        }

        let components = self.components(features);
        let w = &self.config.weights;
        let parts = [
            components.elevation.map(|s| (w.elevation, s)),
            components.water_proximity.map(|s| (w.water_proximity, s)),
            components.rainfall.map(|s| (w.rainfall, s)),
        ];
        let value = weighted_mean(parts.iter().flatten().copied()).ok_or_else(|| {
            FloodRiskError::DataUnavailable("present features carry no weight".to_string())
        })?;
        let confidence = present as f64 / FEATURE_COUNT as f64;

        Ok(RiskScore::new(
            value,
            confidence,
            computed_at,
            *features,
            components,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scorer() -> RiskScorer {
        RiskScorer::new(ScoringConfig::default())
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 14, 6, 0, 0).unwrap()
    }

    fn full(elevation: f64, distance: f64, r24: f64, r72: f64) -> FeatureVector {
        FeatureVector {
            elevation_m: Some(elevation),
            water_distance_m: Some(distance),
            rainfall_mm_24h: Some(r24),
            rainfall_mm_72h: Some(r72),
        }
    }

    #[test]
    fn test_low_lying_wet_site_scores_near_one() {
        let score = scorer().score(&full(2.0, 5.0, 150.0, 200.0), at()).unwrap();
        // 0.3 * 0.996 + 0.3 * 0.9975 + 0.4 * 1.0
        assert!((score.value() - 0.99805).abs() < 1e-9, "got {}", score.value());
        assert_eq!(score.confidence(), 1.0);
        assert_eq!(score.computed_at(), at());
    }

    #[test]
    fn test_high_dry_remote_site_scores_zero() {
        let score = scorer().score(&full(800.0, 5_000.0, 0.0, 0.0), at()).unwrap();
        assert_eq!(score.value(), 0.0);
    }

    #[test]
    fn test_rainfall_only_uses_rainfall_subscore() {
        let v = FeatureVector {
            rainfall_mm_24h: Some(50.0),
            rainfall_mm_72h: Some(100.0),
            ..FeatureVector::default()
        };
        let score = scorer().score(&v, at()).unwrap();
        // 0.6 * 0.5 + 0.4 * 0.5
        assert!((score.value() - 0.5).abs() < 1e-12);
        assert_eq!(score.confidence(), 1.0 / 3.0);
        assert_eq!(score.components().elevation, None);
    }

    #[test]
    fn test_confidence_is_fraction_of_present_features() {
        let two = FeatureVector {
            elevation_m: Some(10.0),
            water_distance_m: None,
            rainfall_mm_24h: None,
            rainfall_mm_72h: Some(20.0),
        };
        assert_eq!(scorer().score(&two, at()).unwrap().confidence(), 2.0 / 3.0);
    }

    #[test]
    fn test_single_rainfall_window_is_renormalized() {
        let only_24h = FeatureVector {
            rainfall_mm_24h: Some(30.0),
            ..FeatureVector::default()
        };
        let score = scorer().score(&only_24h, at()).unwrap();
        assert!((score.value() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_extreme_values_clamp() {
        assert_eq!(elevation_subscore(-12.0, 500.0), 1.0);
        assert_eq!(elevation_subscore(0.0, 500.0), 1.0);
        assert_eq!(elevation_subscore(900.0, 500.0), 0.0);
        assert_eq!(proximity_subscore(0.0, 2_000.0), 1.0);
        assert_eq!(proximity_subscore(10_000.0, 2_000.0), 0.0);

        let capped = scorer().score(&full(100.0, 100.0, 100.0, 200.0), at()).unwrap();
        let flood = scorer().score(&full(100.0, 100.0, 900.0, 2_000.0), at()).unwrap();
        assert_eq!(capped.value(), flood.value());
    }

    #[test]
    fn test_score_is_monotonic_in_each_feature() {
        let s = scorer();
        let base = full(120.0, 600.0, 30.0, 60.0);
        let base_value = s.score(&base, at()).unwrap().value();

        let lower = full(60.0, 600.0, 30.0, 60.0);
        let closer = full(120.0, 200.0, 30.0, 60.0);
        let wetter = full(120.0, 600.0, 45.0, 90.0);
        for v in [lower, closer, wetter] {
            assert!(s.score(&v, at()).unwrap().value() >= base_value);
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let v = full(37.5, 410.0, 12.3, 45.6);
        let a = scorer().score(&v, at()).unwrap();
        let b = scorer().score(&v, at()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_vector_is_data_unavailable() {
        let result = scorer().score(&FeatureVector::default(), at());
        assert!(matches!(result, Err(FloodRiskError::DataUnavailable(_))));
    }

    #[test]
    fn test_negative_rainfall_is_invalid_input() {
        let v = full(10.0, 10.0, -5.0, 0.0);
        assert!(matches!(
            scorer().score(&v, at()),
            Err(FloodRiskError::InvalidInput(_))
        ));
    }
}
