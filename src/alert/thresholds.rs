//! Risk tier classification and debounced zone updates.
//!
//! A score maps to a tier by pure threshold comparison. Committing that tier
//! to a region's zone is debounced: a new tier must persist across several
//! consecutive readings (or a minimum dwell time) before it replaces the
//! committed one, so a single noisy reading never flips a zone or opens an
//! alert.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::config::{DebounceConfig, TierThresholds};
use crate::logging::{self, Component};
use crate::model::{FloodRiskError, RegionId, RiskScore, RiskTier, RiskZone};
use crate::store::ZoneStore;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Maps a score value to its tier. Each lower bound is inclusive: a value
/// exactly on `thresholds.moderate` is MODERATE.
pub fn classify_value(value: f64, thresholds: &TierThresholds) -> RiskTier {
    if value >= thresholds.severe {
        RiskTier::Severe
    } else if value >= thresholds.high {
        RiskTier::High
    } else if value >= thresholds.moderate {
        RiskTier::Moderate
    } else {
        RiskTier::Low
    }
}

// ---------------------------------------------------------------------------
// Debounce window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
}

/// A tier change that has been observed but not yet committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTransition {
    /// Least extreme tier seen during the window: the tier that has actually
    /// persisted for every reading so far.
    pub tier: RiskTier,
    pub direction: Direction,
    pub readings: u32,
    pub since: DateTime<Utc>,
}

/// Per-region debounce state. Owned by the caller that serializes
/// evaluations of the region; only replaced after a successful zone save.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DebounceWindow {
    pending: Option<PendingTransition>,
}

impl DebounceWindow {
    pub fn pending(&self) -> Option<&PendingTransition> {
        self.pending.as_ref()
    }
}

/// Result of applying one score to a zone, before anything is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDecision {
    pub zone: RiskZone,
    pub pending: Option<PendingTransition>,
    /// The committed tier before this score.
    pub previous_tier: RiskTier,
    pub tier_changed: bool,
    /// The score was older than the zone's current score and was ignored.
    pub superseded: bool,
}

/// Applies `score` (classified as `candidate`) to the current zone and
/// pending window. Pure: no I/O, no clock.
///
/// A region without a zone starts at LOW, so reaching any higher tier goes
/// through the same debounce as every later change.
pub fn decide(
    region_id: &RegionId,
    current: Option<&RiskZone>,
    pending: Option<&PendingTransition>,
    score: RiskScore,
    candidate: RiskTier,
    debounce: &DebounceConfig,
) -> ZoneDecision {
    let at = score.computed_at();

    if let Some(zone) = current {
        if at < zone.current_score.computed_at() {
            return ZoneDecision {
                zone: zone.clone(),
                pending: pending.copied(),
                previous_tier: zone.tier,
                tier_changed: false,
                superseded: true,
            };
        }
    }

    let (committed, tier_since) = match current {
        Some(zone) => (zone.tier, zone.tier_since),
        None => (RiskTier::Low, at),
    };
    let mut zone = RiskZone {
        region_id: region_id.clone(),
        tier: committed,
        current_score: score,
        tier_since,
    };

    if candidate == committed {
        return ZoneDecision {
            zone,
            pending: None,
            previous_tier: committed,
            tier_changed: false,
            superseded: false,
        };
    }

    let direction = if candidate > committed {
        Direction::Rising
    } else {
        Direction::Falling
    };
    let continues = |p: &&PendingTransition| {
        p.direction == direction
            && match direction {
                Direction::Rising => p.tier > committed,
                Direction::Falling => p.tier < committed,
            }
    };
    let next = match pending.filter(continues) {
        Some(p) => PendingTransition {
            tier: match direction {
                Direction::Rising => p.tier.min(candidate),
                Direction::Falling => p.tier.max(candidate),
            },
            direction,
            readings: p.readings.saturating_add(1),
            since: p.since,
        },
        None => PendingTransition {
            tier: candidate,
            direction,
            readings: 1,
            since: at,
        },
    };

    let dwell_reached = debounce
        .min_dwell_minutes
        .map(|minutes| at - next.since >= Duration::minutes(minutes as i64))
        .unwrap_or(false);

    if next.readings >= debounce.consecutive_readings || dwell_reached {
        zone.tier = next.tier;
        zone.tier_since = at;
        ZoneDecision {
            zone,
            pending: None,
            previous_tier: committed,
            tier_changed: true,
            superseded: false,
        }
    } else {
        ZoneDecision {
            zone,
            pending: Some(next),
            previous_tier: committed,
            tier_changed: false,
            superseded: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Zone classifier
// ---------------------------------------------------------------------------

/// Outcome of `ZoneClassifier::update`.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneUpdate {
    pub zone: RiskZone,
    pub previous_tier: RiskTier,
    pub tier_changed: bool,
    pub superseded: bool,
}

pub struct ZoneClassifier {
    thresholds: TierThresholds,
    debounce: DebounceConfig,
    store: Arc<dyn ZoneStore>,
}

impl ZoneClassifier {
    pub fn new(thresholds: TierThresholds, debounce: DebounceConfig, store: Arc<dyn ZoneStore>) -> Self {
        ZoneClassifier {
            thresholds,
            debounce,
            store,
        }
    }

    pub fn classify(&self, score: &RiskScore) -> RiskTier {
        classify_value(score.value(), &self.thresholds)
    }

    pub fn store(&self) -> &Arc<dyn ZoneStore> {
        &self.store
    }

    /// Applies a new score to the region's zone and persists it.
    ///
    /// `window` is replaced only once the zone has been saved, so the pending
    /// counter never runs ahead of the stored tier. On `StorageUnavailable`
    /// nothing changes and the caller retries with the same score.
    pub fn update(
        &self,
        region_id: &RegionId,
        score: RiskScore,
        window: &mut DebounceWindow,
    ) -> Result<ZoneUpdate, FloodRiskError> {
        let candidate = self.classify(&score);
        let current = self.store.load_zone(region_id)?;

        let decision = decide(
            region_id,
            current.as_ref(),
            window.pending.as_ref(),
            score,
            candidate,
            &self.debounce,
        );

        if decision.superseded {
            logging::debug(
                Component::ZoneStore,
                Some(region_id.as_str()),
                "score older than current zone score; superseded",
            );
        } else {
            self.store.save_zone(&decision.zone)?;
            window.pending = decision.pending;

            if decision.tier_changed {
                logging::info(
                    Component::ZoneStore,
                    Some(region_id.as_str()),
                    &format!(
                        "{}: tier {} -> {} (score {:.3})",
                        region_id,
                        decision.previous_tier,
                        decision.zone.tier,
                        decision.zone.current_score.value()
                    ),
                );
            } else if let Some(p) = &decision.pending {
                logging::debug(
                    Component::ZoneStore,
                    Some(region_id.as_str()),
                    &format!(
                        "pending {} ({} of {} readings)",
                        p.tier, p.readings, self.debounce.consecutive_readings
                    ),
                );
            }
        }

        Ok(ZoneUpdate {
            zone: decision.zone,
            previous_tier: decision.previous_tier,
            tier_changed: decision.tier_changed,
            superseded: decision.superseded,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureVector, SubScores};
    use crate::store::{MemoryZoneStore, StoreError};
    use chrono::TimeZone;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 14, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn score(value: f64, minute: i64) -> RiskScore {
        RiskScore::new(value, 1.0, t(minute), FeatureVector::default(), SubScores::default())
    }

    fn region() -> RegionId {
        RegionId::parse("nsanje").unwrap()
    }

    fn classifier(readings: u32) -> (ZoneClassifier, Arc<MemoryZoneStore>) {
        let store = Arc::new(MemoryZoneStore::new());
        let debounce = DebounceConfig {
            consecutive_readings: readings,
            min_dwell_minutes: None,
        };
        (
            ZoneClassifier::new(TierThresholds::default(), debounce, store.clone()),
            store,
        )
    }

    #[test]
    fn test_boundaries_fall_on_the_inclusive_side() {
        let th = TierThresholds::default();
        assert_eq!(classify_value(0.0, &th), RiskTier::Low);
        assert_eq!(classify_value(0.2499, &th), RiskTier::Low);
        assert_eq!(classify_value(0.25, &th), RiskTier::Moderate);
        assert_eq!(classify_value(0.5, &th), RiskTier::High);
        assert_eq!(classify_value(0.75, &th), RiskTier::Severe);
        assert_eq!(classify_value(1.0, &th), RiskTier::Severe);
    }

    #[test]
    fn test_custom_thresholds_are_honoured() {
        let th = TierThresholds {
            moderate: 0.1,
            high: 0.2,
            severe: 0.9,
        };
        assert_eq!(classify_value(0.15, &th), RiskTier::Moderate);
        assert_eq!(classify_value(0.85, &th), RiskTier::High);
    }

    #[test]
    fn test_first_score_creates_low_zone_with_pending_change() {
        let (classifier, store) = classifier(3);
        let mut window = DebounceWindow::default();
        let update = classifier.update(&region(), score(0.9, 0), &mut window).unwrap();

        assert_eq!(update.zone.tier, RiskTier::Low);
        assert!(!update.tier_changed);
        assert_eq!(window.pending().map(|p| p.readings), Some(1));
        assert!(store.load_zone(&region()).unwrap().is_some());
    }

    #[test]
    fn test_single_transient_reading_does_not_commit() {
        let (classifier, _) = classifier(3);
        let mut window = DebounceWindow::default();
        classifier.update(&region(), score(0.1, 0), &mut window).unwrap();
        let spike = classifier.update(&region(), score(0.8, 15), &mut window).unwrap();
        let calm = classifier.update(&region(), score(0.1, 30), &mut window).unwrap();

        assert!(!spike.tier_changed);
        assert!(!calm.tier_changed);
        assert_eq!(calm.zone.tier, RiskTier::Low);
        assert!(window.pending().is_none(), "a reading at the committed tier clears the window");
    }

    #[test]
    fn test_n_consecutive_readings_commit() {
        let (classifier, _) = classifier(3);
        let mut window = DebounceWindow::default();
        let first = classifier.update(&region(), score(0.8, 0), &mut window).unwrap();
        let second = classifier.update(&region(), score(0.8, 15), &mut window).unwrap();
        let third = classifier.update(&region(), score(0.8, 30), &mut window).unwrap();

        assert!(!first.tier_changed && !second.tier_changed);
        assert!(third.tier_changed);
        assert_eq!(third.zone.tier, RiskTier::Severe);
        assert_eq!(third.previous_tier, RiskTier::Low);
        assert_eq!(third.zone.tier_since, t(30));
    }

    #[test]
    fn test_mixed_readings_commit_the_tier_that_persisted() {
        let (classifier, _) = classifier(3);
        let mut window = DebounceWindow::default();
        classifier.update(&region(), score(0.9, 0), &mut window).unwrap();
        classifier.update(&region(), score(0.6, 15), &mut window).unwrap();
        let third = classifier.update(&region(), score(0.9, 30), &mut window).unwrap();

        assert!(third.tier_changed);
        assert_eq!(third.zone.tier, RiskTier::High);
    }

    #[test]
    fn test_direction_reversal_restarts_the_window() {
        let (classifier, store) = classifier(2);
        let mut window = DebounceWindow::default();
        classifier.update(&region(), score(0.6, 0), &mut window).unwrap();
        classifier.update(&region(), score(0.6, 15), &mut window).unwrap();
        assert_eq!(store.load_zone(&region()).unwrap().unwrap().tier, RiskTier::High);

        classifier.update(&region(), score(0.1, 30), &mut window).unwrap();
        classifier.update(&region(), score(0.9, 45), &mut window).unwrap();
        let p = window.pending().expect("rising window open");
        assert_eq!(p.direction, Direction::Rising);
        assert_eq!(p.readings, 1);
    }

    #[test]
    fn test_min_dwell_commits_before_reading_count() {
        let store = Arc::new(MemoryZoneStore::new());
        let debounce = DebounceConfig {
            consecutive_readings: 10,
            min_dwell_minutes: Some(30),
        };
        let classifier = ZoneClassifier::new(TierThresholds::default(), debounce, store);
        let mut window = DebounceWindow::default();
        let early = classifier.update(&region(), score(0.6, 0), &mut window).unwrap();
        let late = classifier.update(&region(), score(0.6, 30), &mut window).unwrap();
        assert!(!early.tier_changed);
        assert!(late.tier_changed);
        assert_eq!(late.zone.tier, RiskTier::High);
    }

    #[test]
    fn test_older_score_is_superseded() {
        let (classifier, store) = classifier(1);
        let mut window = DebounceWindow::default();
        classifier.update(&region(), score(0.9, 30), &mut window).unwrap();
        let stale = classifier.update(&region(), score(0.1, 15), &mut window).unwrap();

        assert!(stale.superseded);
        assert!(!stale.tier_changed);
        let stored = store.load_zone(&region()).unwrap().unwrap();
        assert_eq!(stored.tier, RiskTier::Severe);
        assert_eq!(stored.current_score.computed_at(), t(30));
    }

    struct FailingStore;

    impl ZoneStore for FailingStore {
        fn load_zone(&self, _: &RegionId) -> Result<Option<RiskZone>, StoreError> {
            Ok(None)
        }
        fn save_zone(&self, _: &RiskZone) -> Result<(), StoreError> {
            Err(StoreError("connection refused".to_string()))
        }
        fn list_zones(&self) -> Result<Vec<RiskZone>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_failed_save_leaves_window_untouched() {
        let classifier = ZoneClassifier::new(
            TierThresholds::default(),
            DebounceConfig::default(),
            Arc::new(FailingStore),
        );
        let mut window = DebounceWindow::default();
        let result = classifier.update(&region(), score(0.9, 0), &mut window);
        assert!(matches!(result, Err(FloodRiskError::StorageUnavailable(_))));
        assert!(window.pending().is_none());
    }
}
