//! Spatial feature resolution.
//!
//! Turns a location into a `FeatureVector` by querying the terrain,
//! water-body and rainfall collaborators at the same coordinate. The four
//! lookups (elevation, water distance, rainfall 24h and 72h) run on their
//! own threads and are collected against a single deadline, so a hung
//! collaborator costs at most one timeout and never blocks the pipeline.
//!
//! Partial failure is normal: a failed or late lookup leaves its field
//! absent and is logged. Only when every lookup fails does resolution fail
//! with `DataUnavailable`.
//!
//! A lookup abandoned at the deadline keeps its thread until the
//! collaborator returns. While one is outstanding, that lookup is not
//! started again and reports a timeout at once, so a hung collaborator holds
//! one thread per lookup rather than one per resolution.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::ingest::{RainfallSource, RainfallWindow, SourceError, TerrainSource, WaterBodyLayer};
use crate::logging::{self, Component};
use crate::model::{Coordinate, FeatureVector, FloodRiskError, Location};
use crate::regions::RegionLookup;

/// The data collaborators the resolver queries.
#[derive(Clone)]
pub struct DataSources {
    pub terrain: Arc<dyn TerrainSource>,
    pub water: Arc<dyn WaterBodyLayer>,
    pub rainfall: Arc<dyn RainfallSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Elevation,
    WaterDistance,
    Rainfall24h,
    Rainfall72h,
}

impl Lookup {
    const COUNT: usize = 4;

    const ALL: [Lookup; Lookup::COUNT] = [
        Lookup::Elevation,
        Lookup::WaterDistance,
        Lookup::Rainfall24h,
        Lookup::Rainfall72h,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn component(&self) -> Component {
        match self {
            Lookup::Elevation => Component::Terrain,
            Lookup::WaterDistance => Component::WaterBodies,
            Lookup::Rainfall24h | Lookup::Rainfall72h => Component::Rainfall,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Lookup::Elevation => "elevation",
            Lookup::WaterDistance => "water distance",
            Lookup::Rainfall24h => "rainfall 24h",
            Lookup::Rainfall72h => "rainfall 72h",
        }
    }

    /// Rejects values that would break the feature vector invariants.
    fn check(&self, value: f64) -> Result<f64, SourceError> {
        let ok = match self {
            Lookup::Elevation => value.is_finite(),
            _ => value.is_finite() && value >= 0.0,
        };
        if ok {
            Ok(value)
        } else {
            Err(SourceError::Parse(format!(
                "implausible {} value {}",
                self.label(),
                value
            )))
        }
    }
}

type LookupResult = (Lookup, Result<f64, SourceError>);

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Abandoned lookups whose thread has not returned yet, per lookup.
type Stalled = Arc<[AtomicUsize; Lookup::COUNT]>;

/// Marks a lookup thread finished when dropped, panics included. A lookup
/// that was already abandoned gives back its stalled count instead.
struct Finish {
    lookup: Lookup,
    state: Arc<AtomicU8>,
    stalled: Stalled,
}

impl Drop for Finish {
    fn drop(&mut self) {
        if self
            .state
            .compare_exchange(RUNNING, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stalled[self.lookup.index()].fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FeatureResolver {
    sources: DataSources,
    regions: Arc<dyn RegionLookup>,
    timeout: Duration,
    stalled: Stalled,
}

impl FeatureResolver {
    pub fn new(sources: DataSources, regions: Arc<dyn RegionLookup>, timeout: Duration) -> Self {
        FeatureResolver {
            sources,
            regions,
            timeout,
            stalled: Arc::new(Default::default()),
        }
    }

    /// The coordinate a location's features are measured at.
    pub fn locate(&self, location: &Location) -> Result<Coordinate, FloodRiskError> {
        match location {
            Location::Point(c) => Ok(*c),
            Location::Region(id) => self.regions.coordinate_of(id).ok_or_else(|| {
                FloodRiskError::InvalidInput(format!("unknown region '{}'", id))
            }),
        }
    }

    pub fn resolve(&self, location: &Location) -> Result<FeatureVector, FloodRiskError> {
        let at = self.locate(location)?;
        let key = location.to_string();

        let mut failures = 0;
        let mut pending: Vec<(Lookup, Arc<AtomicU8>)> = Vec::new();
        let (tx, rx) = mpsc::channel::<LookupResult>();
        for lookup in Lookup::ALL {
            if self.stalled[lookup.index()].load(Ordering::SeqCst) > 0 {
                failures += 1;
                logging::log_source_failure(
                    lookup.component(),
                    &key,
                    lookup.label(),
                    &self.timed_out(lookup),
                );
                continue;
            }
            match self.spawn_lookup(&tx, lookup, at) {
                Some(state) => pending.push((lookup, state)),
                None => failures += 1,
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut features = FeatureVector::default();

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (lookup, result) = match rx.recv_timeout(remaining) {
                Ok(received) => received,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            };
            pending.retain(|(p, _)| *p != lookup);

            match result.and_then(|v| lookup.check(v)) {
                Ok(value) => {
                    let slot = match lookup {
                        Lookup::Elevation => &mut features.elevation_m,
                        Lookup::WaterDistance => &mut features.water_distance_m,
                        Lookup::Rainfall24h => &mut features.rainfall_mm_24h,
                        Lookup::Rainfall72h => &mut features.rainfall_mm_72h,
                    };
                    *slot = Some(value);
                }
                Err(e) => {
                    failures += 1;
                    logging::log_source_failure(lookup.component(), &key, lookup.label(), &e);
                }
            }
        }

        for (lookup, state) in pending {
            self.abandon(lookup, &state);
            failures += 1;
            logging::log_source_failure(
                lookup.component(),
                &key,
                lookup.label(),
                &self.timed_out(lookup),
            );
        }

        if features.present_features() == 0 {
            return Err(FloodRiskError::DataUnavailable(format!(
                "all {} lookups failed for {}",
                failures, key
            )));
        }
        Ok(features)
    }

    fn timed_out(&self, lookup: Lookup) -> SourceError {
        SourceError::Timeout {
            source: lookup.label(),
            after: self.timeout,
        }
    }

    /// Counts a lookup that missed the deadline as stalled until its thread
    /// returns.
    fn abandon(&self, lookup: Lookup, state: &AtomicU8) {
        let stalled = &self.stalled[lookup.index()];
        stalled.fetch_add(1, Ordering::SeqCst);
        if state
            .compare_exchange(RUNNING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Returned after the deadline but before this point.
            stalled.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Starts one lookup thread. Returns its state, or `None` if no thread
    /// could be started.
    fn spawn_lookup(
        &self,
        tx: &Sender<LookupResult>,
        lookup: Lookup,
        at: Coordinate,
    ) -> Option<Arc<AtomicU8>> {
        let tx = tx.clone();
        let sources = self.sources.clone();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let finish = Finish {
            lookup,
            state: state.clone(),
            stalled: self.stalled.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("lookup-{}", lookup.label().replace(' ', "-")))
            .spawn(move || {
                let _finish = finish;
                let result = match lookup {
                    Lookup::Elevation => sources.terrain.elevation(&at),
                    Lookup::WaterDistance => sources.water.nearest_distance(&at),
                    Lookup::Rainfall24h => sources.rainfall.rainfall(&at, RainfallWindow::Hours24),
                    Lookup::Rainfall72h => sources.rainfall.rainfall(&at, RainfallWindow::Hours72),
                };
                // The receiver is gone once the deadline has passed.
                let _ = tx.send((lookup, result));
            });
        match spawned {
            Ok(_) => Some(state),
            Err(e) => {
                logging::error(
                    Component::Engine,
                    None,
                    &format!("could not start {} lookup: {}", lookup.label(), e),
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
