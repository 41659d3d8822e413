/// Risk zone staleness detection.
///
/// Regions are re-scored on a schedule. If a data collaborator keeps
/// failing, a zone can silently keep showing an old score, which is
/// dangerous while rain is still falling. This module flags zones whose
/// current score has not been refreshed recently so the scheduler can
/// re-score them first and the log shows the gap.
///
/// # Clock injection
/// All functions accept a `now: DateTime<Utc>` parameter rather than calling
/// `Utc::now()` internally. This makes staleness purely deterministic in
/// tests without mocking or time manipulation.

use chrono::{DateTime, Utc};

use crate::model::RiskZone;

// ---------------------------------------------------------------------------
// Staleness check
// ---------------------------------------------------------------------------

/// Age of the zone's current score in whole minutes relative to `now`.
/// Scores computed after `now` have age zero.
pub fn score_age_minutes(zone: &RiskZone, now: DateTime<Utc>) -> u64 {
    let age = (now - zone.current_score.computed_at()).num_minutes();
    age.max(0) as u64
}

/// Returns `true` if the zone's current score is older than
/// `max_age_minutes` relative to `now`.
///
/// Staleness is defined as strictly greater than the threshold:
///   age > max_age_minutes  →  stale
///   age == max_age_minutes →  not stale
pub fn is_stale_at(zone: &RiskZone, max_age_minutes: u64, now: DateTime<Utc>) -> bool {
    score_age_minutes(zone, now) > max_age_minutes
}

/// Convenience wrapper that uses the real current time.
/// Use `is_stale_at` in tests to keep them deterministic.
pub fn is_stale(zone: &RiskZone, max_age_minutes: u64) -> bool {
    is_stale_at(zone, max_age_minutes, Utc::now())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureVector, RegionId, RiskScore, RiskTier, SubScores};
    use chrono::TimeZone;

    fn zone_scored_at(computed_at: DateTime<Utc>) -> RiskZone {
        RiskZone {
            region_id: RegionId::parse("karonga").unwrap(),
            tier: RiskTier::Moderate,
            current_score: RiskScore::new(
                0.3,
                1.0,
                computed_at,
                FeatureVector::default(),
                SubScores::default(),
            ),
            tier_since: computed_at,
        }
    }

    /// A fixed "now" used across all tests: 2025-01-14 13:00:00 UTC.
    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 14, 13, 0, 0).unwrap()
    }

    // --- Not stale ----------------------------------------------------------

    #[test]
    fn test_zone_5_minutes_old_is_not_stale() {
        let zone = zone_scored_at(Utc.with_ymd_and_hms(2025, 1, 14, 12, 55, 0).unwrap());
        assert!(!is_stale_at(&zone, 15, fixed_now()));
    }

    #[test]
    fn test_zone_exactly_at_threshold_is_not_stale() {
        // Age == threshold should NOT be considered stale (strictly greater than).
        let zone = zone_scored_at(Utc.with_ymd_and_hms(2025, 1, 14, 12, 45, 0).unwrap());
        assert!(
            !is_stale_at(&zone, 15, fixed_now()),
            "zone exactly at threshold (15 min) should not be stale"
        );
    }

    #[test]
    fn test_score_from_the_future_has_zero_age() {
        let zone = zone_scored_at(Utc.with_ymd_and_hms(2025, 1, 14, 13, 5, 0).unwrap());
        assert_eq!(score_age_minutes(&zone, fixed_now()), 0);
        assert!(!is_stale_at(&zone, 0, fixed_now()));
    }

    // --- Stale --------------------------------------------------------------

    #[test]
    fn test_zone_one_minute_past_threshold_is_stale() {
        let zone = zone_scored_at(Utc.with_ymd_and_hms(2025, 1, 14, 12, 44, 0).unwrap());
        assert!(is_stale_at(&zone, 15, fixed_now()));
    }

    #[test]
    fn test_same_zone_stale_under_tight_threshold_not_under_loose() {
        let zone = zone_scored_at(Utc.with_ymd_and_hms(2025, 1, 14, 12, 30, 0).unwrap());
        assert!(is_stale_at(&zone, 20, fixed_now()));
        assert!(!is_stale_at(&zone, 60, fixed_now()));
    }
}
