//! The flood risk engine: resolver, scorer, zone classifier and alert
//! manager wired into one pipeline.
//!
//! ```text
//!   Location ──► FeatureResolver ──► RiskScorer ──► RiskScore
//!                                                    │
//!                          (per-region lock) ────────┤
//!                                                    ▼
//!                                  ZoneClassifier ──► AlertManager ──► sinks
//! ```
//!
//! Distinct regions evaluate independently and may run in parallel. Within a
//! region, zone update, alert transition and event dispatch happen under that
//! region's lock, so a later evaluation always observes the effects of an
//! earlier one.
//!
//! Every commit also reconciles the alert state with the stored zone. After
//! a restart without saved alerts, or a failed alert write, the next score
//! for a HIGH or SEVERE zone opens the missing alert and a calm zone
//! resolves a stranded one.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::alert::manager::{AlertManager, AlertSink, UndeliveredEvent};
use crate::alert::stalenesses;
use crate::alert::thresholds::{DebounceWindow, ZoneClassifier, ZoneUpdate};
use crate::analysis::resolver::{DataSources, FeatureResolver};
use crate::analysis::scoring::RiskScorer;
use crate::config::{ConfigError, EngineConfig};
use crate::logging::{self, Component};
use crate::model::{Alert, AlertEvent, FloodRiskError, Location, RegionId, RiskScore, RiskTier, RiskZone};
use crate::regions::RegionLookup;
use crate::store::{AlertStore, ZoneStore};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A committed score: the zone update and the alert events it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub update: ZoneUpdate,
    pub events: Vec<AlertEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(Commit),
    /// The zone store was unavailable. Nothing changed; retry the score with
    /// `FloodRiskEngine::commit_score`.
    Deferred { reason: String },
}

/// Result of evaluating one region.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: RiskScore,
    pub outcome: CommitOutcome,
}

impl Evaluation {
    pub fn is_deferred(&self) -> bool {
        matches!(self.outcome, CommitOutcome::Deferred { .. })
    }
}

/// Per-region result of `evaluate_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionEvaluation {
    pub region_id: RegionId,
    pub result: Result<Evaluation, FloodRiskError>,
}

/// Filter for `zones_matching`. Empty fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZoneFilter {
    pub tier: Option<RiskTier>,
    pub min_score: Option<f64>,
}

impl ZoneFilter {
    fn matches(&self, zone: &RiskZone) -> bool {
        self.tier.map_or(true, |t| zone.tier == t)
            && self
                .min_score
                .map_or(true, |min| zone.current_score.value() >= min)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskStatistics {
    /// Regions with a stored zone.
    pub regions: usize,
    /// Zone count for every tier, including empty ones.
    pub zones_by_tier: BTreeMap<RiskTier, usize>,
    pub active_alerts: usize,
    /// Alerts ever opened.
    pub total_alerts: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct FloodRiskEngine {
    resolver: FeatureResolver,
    scorer: RiskScorer,
    classifier: ZoneClassifier,
    alerts: AlertManager,
    regions: Arc<dyn RegionLookup>,
    windows: Mutex<HashMap<RegionId, Arc<Mutex<DebounceWindow>>>>,
}

impl FloodRiskEngine {
    /// An engine whose alerts are kept in memory only.
    pub fn new(
        config: EngineConfig,
        sources: DataSources,
        regions: Arc<dyn RegionLookup>,
        store: Arc<dyn ZoneStore>,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(config, sources, regions, store, AlertManager::new(sinks)))
    }

    /// An engine that restores its alerts from `alert_store` and writes
    /// every alert change back to it.
    pub fn with_alert_store(
        config: EngineConfig,
        sources: DataSources,
        regions: Arc<dyn RegionLookup>,
        store: Arc<dyn ZoneStore>,
        alert_store: Arc<dyn AlertStore>,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Result<Self, FloodRiskError> {
        config
            .validate()
            .map_err(|e| FloodRiskError::InvalidInput(e.to_string()))?;
        let alerts = AlertManager::with_store(alert_store, sinks)?;
        Ok(Self::assemble(config, sources, regions, store, alerts))
    }

    fn assemble(
        config: EngineConfig,
        sources: DataSources,
        regions: Arc<dyn RegionLookup>,
        store: Arc<dyn ZoneStore>,
        alerts: AlertManager,
    ) -> Self {
        FloodRiskEngine {
            resolver: FeatureResolver::new(
                sources,
                regions.clone(),
                config.resolver.source_timeout(),
            ),
            scorer: RiskScorer::new(config.scoring),
            classifier: ZoneClassifier::new(config.tiers, config.debounce, store),
            alerts,
            regions,
            windows: Mutex::new(HashMap::new()),
        }
    }

    // --- Scoring ------------------------------------------------------------

    /// Scores a location on demand. Nothing is committed.
    pub fn compute_risk(&self, location: &Location) -> Result<RiskScore, FloodRiskError> {
        self.compute_risk_at(location, Utc::now())
    }

    pub fn compute_risk_at(
        &self,
        location: &Location,
        now: DateTime<Utc>,
    ) -> Result<RiskScore, FloodRiskError> {
        let features = self.resolver.resolve(location)?;
        let score = self.scorer.score(&features, now)?;
        logging::debug(
            Component::Engine,
            Some(&location.to_string()),
            &format!(
                "score {:.3} (confidence {:.2})",
                score.value(),
                score.confidence()
            ),
        );
        Ok(score)
    }

    // --- Evaluation ---------------------------------------------------------

    pub fn evaluate_region(&self, region_id: &RegionId) -> Result<Evaluation, FloodRiskError> {
        self.evaluate_region_at(region_id, Utc::now())
    }

    /// Scores a region and commits the score to its zone and alert state.
    ///
    /// A store outage does not lose the score: it comes back as a deferred
    /// evaluation for the caller to retry.
    pub fn evaluate_region_at(
        &self,
        region_id: &RegionId,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, FloodRiskError> {
        let score = self.compute_risk_at(&Location::Region(region_id.clone()), now)?;
        match self.commit_score(region_id, score.clone()) {
            Ok(commit) => Ok(Evaluation {
                score,
                outcome: CommitOutcome::Committed(commit),
            }),
            Err(FloodRiskError::StorageUnavailable(reason)) => {
                logging::warn(
                    Component::ZoneStore,
                    Some(region_id.as_str()),
                    &format!("commit deferred: {}", reason),
                );
                Ok(Evaluation {
                    score,
                    outcome: CommitOutcome::Deferred { reason },
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Applies an already computed score to the region's zone, then drives
    /// the alert state machine with any committed tier change, or with the
    /// zone's tier when the alert state disagrees with it.
    pub fn commit_score(
        &self,
        region_id: &RegionId,
        score: RiskScore,
    ) -> Result<Commit, FloodRiskError> {
        if self.regions.coordinate_of(region_id).is_none() {
            return Err(FloodRiskError::InvalidInput(format!(
                "unknown region '{}'",
                region_id
            )));
        }

        let window = self.window_for(region_id);
        let mut window = lock(&window);

        let update = self.classifier.update(region_id, score, &mut window)?;
        let zone = &update.zone;
        let out_of_step = !update.superseded
            && match self.alerts.open_alert_tier(region_id) {
                Some(tier) => tier != zone.tier,
                None => zone.tier.is_alerting(),
            };

        let mut events = if update.tier_changed {
            self.alerts.apply(region_id, zone.tier, zone.tier_since)
        } else if out_of_step {
            logging::warn(
                Component::Alerts,
                Some(region_id.as_str()),
                &format!("alert state behind zone tier {}, reconciling", zone.tier),
            );
            self.alerts
                .apply(region_id, zone.tier, zone.current_score.computed_at())
        } else {
            Vec::new()
        };
        if let Some(population) = self.regions.population_of(region_id) {
            for event in &mut events {
                event.message.push_str(&format!(" ({} people exposed)", population));
            }
        }
        self.alerts.dispatch(&events);

        Ok(Commit { update, events })
    }

    /// Evaluates every region in parallel and logs the pass summary.
    /// Results come back in input order.
    pub fn evaluate_all(&self, regions: &[RegionId], now: DateTime<Utc>) -> Vec<RegionEvaluation> {
        let results: Vec<RegionEvaluation> = thread::scope(|scope| {
            let handles: Vec<_> = regions
                .iter()
                .map(|id| (id, scope.spawn(move || self.evaluate_region_at(id, now))))
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| RegionEvaluation {
                    region_id: id.clone(),
                    result: handle.join().unwrap_or_else(|_| {
                        Err(FloodRiskError::DataUnavailable(format!(
                            "evaluation of {} panicked",
                            id
                        )))
                    }),
                })
                .collect()
        });

        let mut successful = 0;
        let mut deferred = 0;
        let mut failed = 0;
        for r in &results {
            match &r.result {
                Ok(e) if e.is_deferred() => deferred += 1,
                Ok(_) => successful += 1,
                Err(e) => {
                    failed += 1;
                    logging::warn(
                        Component::Engine,
                        Some(r.region_id.as_str()),
                        &format!("evaluation failed: {}", e),
                    );
                }
            }
        }
        logging::log_evaluation_summary(results.len(), successful, deferred, failed);

        results
    }

    // --- Zones --------------------------------------------------------------

    pub fn current_zones(&self) -> Result<Vec<RiskZone>, FloodRiskError> {
        Ok(self.classifier.store().list_zones()?)
    }

    /// Zones passing `filter`, highest score first.
    pub fn zones_matching(&self, filter: &ZoneFilter) -> Result<Vec<RiskZone>, FloodRiskError> {
        let mut zones: Vec<RiskZone> = self
            .current_zones()?
            .into_iter()
            .filter(|z| filter.matches(z))
            .collect();
        zones.sort_by(|a, b| {
            b.current_score
                .value()
                .total_cmp(&a.current_score.value())
        });
        Ok(zones)
    }

    /// Zones whose current score is older than `max_age_minutes`, oldest
    /// first.
    pub fn stale_zones(
        &self,
        max_age_minutes: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RiskZone>, FloodRiskError> {
        let mut stale: Vec<RiskZone> = self
            .current_zones()?
            .into_iter()
            .filter(|z| stalenesses::is_stale_at(z, max_age_minutes, now))
            .collect();
        stale.sort_by_key(|z| z.current_score.computed_at());
        Ok(stale)
    }

    pub fn statistics(&self) -> Result<RiskStatistics, FloodRiskError> {
        let zones = self.current_zones()?;
        let mut zones_by_tier: BTreeMap<RiskTier, usize> =
            RiskTier::ALL.iter().map(|t| (*t, 0)).collect();
        for zone in &zones {
            *zones_by_tier.entry(zone.tier).or_insert(0) += 1;
        }
        Ok(RiskStatistics {
            regions: zones.len(),
            zones_by_tier,
            active_alerts: self.alerts.active_alerts().len(),
            total_alerts: self.alerts.total_alerts(),
        })
    }

    // --- Alerts -------------------------------------------------------------

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    pub fn alert_history(&self, region_id: &RegionId) -> Vec<Alert> {
        self.alerts.alert_history(region_id)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.recent_alerts(limit)
    }

    pub fn drain_undelivered(&self) -> Vec<UndeliveredEvent> {
        self.alerts.drain_undelivered()
    }

    /// Retries parked events; returns how many are now delivered.
    pub fn redeliver(&self) -> usize {
        self.alerts.redeliver()
    }

    // -----------------------------------------------------------------------

    fn window_for(&self, region_id: &RegionId) -> Arc<Mutex<DebounceWindow>> {
        lock(&self.windows)
            .entry(region_id.clone())
            .or_default()
            .clone()
    }
}

/// Locks, recovering the data if a previous holder panicked. The guarded
/// values are only replaced wholesale, so they are never half-written.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
