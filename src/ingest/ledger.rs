//! In-memory rainfall ledger.
//!
//! Holds manually reported gauge measurements (a field officer's rain gauge
//! reading, a district office report) and serves them as a `RainfallSource`
//! by summing the nearest active station's measurements over the window.
//! Only the longest window's worth of measurements is kept, counted back
//! from the newest one recorded. `db::PgRainfall::record` is the persistent
//! counterpart.

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;

use super::{RainfallSource, RainfallWindow, SourceError};
use crate::model::{Coordinate, FloodRiskError};

/// A rain gauge that can report measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeStation {
    pub station_code: String,
    pub location: Coordinate,
    pub active: bool,
}

/// One reported measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct RainfallMeasurement {
    pub station_code: String,
    pub rainfall_mm: f64,
    /// Hours of accumulation the amount covers; informational.
    pub duration_hours: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Rejects amounts no gauge can report.
pub fn validate_measurement(measurement: &RainfallMeasurement) -> Result<(), FloodRiskError> {
    if !measurement.rainfall_mm.is_finite() || measurement.rainfall_mm < 0.0 {
        return Err(FloodRiskError::InvalidInput(format!(
            "rainfall_mm must be non-negative, got {}",
            measurement.rainfall_mm
        )));
    }
    if measurement.station_code.trim().is_empty() {
        return Err(FloodRiskError::InvalidInput("station code is empty".to_string()));
    }
    Ok(())
}

#[derive(Default)]
struct LedgerState {
    stations: Vec<GaugeStation>,
    measurements: Vec<RainfallMeasurement>,
}

pub struct RainfallLedger {
    state: RwLock<LedgerState>,
    max_station_distance_m: f64,
}

impl RainfallLedger {
    pub fn new(max_station_distance_m: f64) -> Self {
        RainfallLedger {
            state: RwLock::new(LedgerState::default()),
            max_station_distance_m,
        }
    }

    pub fn add_station(&self, station: GaugeStation) {
        if let Ok(mut state) = self.state.write() {
            state.stations.retain(|s| s.station_code != station.station_code);
            state.stations.push(station);
        }
    }

    /// Records a measurement. Negative or non-finite amounts and unknown
    /// stations are rejected. Measurements that fall outside the 72h window
    /// ending at the newest one are dropped.
    pub fn record(&self, measurement: RainfallMeasurement) -> Result<(), FloodRiskError> {
        validate_measurement(&measurement)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| FloodRiskError::StorageUnavailable("rainfall ledger lock poisoned".to_string()))?;
        if !state
            .stations
            .iter()
            .any(|s| s.station_code == measurement.station_code)
        {
            return Err(FloodRiskError::InvalidInput(format!(
                "unknown rainfall station '{}'",
                measurement.station_code
            )));
        }
        state.measurements.push(measurement);

        if let Some(newest) = state.measurements.iter().map(|m| m.recorded_at).max() {
            let cutoff = newest - Duration::hours(RainfallWindow::Hours72.hours());
            state.measurements.retain(|m| m.recorded_at > cutoff);
        }
        Ok(())
    }

    /// Rainfall at the nearest active station over `(end - window, end]`.
    pub fn total_at(
        &self,
        at: &Coordinate,
        window: RainfallWindow,
        end: DateTime<Utc>,
    ) -> Result<f64, SourceError> {
        let state = self
            .state
            .read()
            .map_err(|_| SourceError::Query("rainfall ledger lock poisoned".to_string()))?;

        let station = state
            .stations
            .iter()
            .filter(|s| s.active)
            .map(|s| (s, s.location.distance_m(at)))
            .filter(|(_, d)| *d <= self.max_station_distance_m)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| s)
            .ok_or_else(|| SourceError::NoData(format!("no active rain gauge near {}", at)))?;

        let start = end - Duration::hours(window.hours());
        let total = state
            .measurements
            .iter()
            .filter(|m| m.station_code == station.station_code)
            .filter(|m| m.recorded_at > start && m.recorded_at <= end)
            .map(|m| m.rainfall_mm)
            .sum();
        Ok(total)
    }
}

impl RainfallSource for RainfallLedger {
    fn rainfall(&self, at: &Coordinate, window: RainfallWindow) -> Result<f64, SourceError> {
        self.total_at(at, window, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger_with_station() -> RainfallLedger {
        let ledger = RainfallLedger::new(25_000.0);
        ledger.add_station(GaugeStation {
            station_code: "NSJ-01".to_string(),
            location: Coordinate::new(-16.92, 35.26).unwrap(),
            active: true,
        });
        ledger
    }

    fn measurement(mm: f64, at: DateTime<Utc>) -> RainfallMeasurement {
        RainfallMeasurement {
            station_code: "NSJ-01".to_string(),
            rainfall_mm: mm,
            duration_hours: 1,
            recorded_at: at,
        }
    }

    #[test]
    fn test_windows_sum_only_their_measurements() {
        let ledger = ledger_with_station();
        let now = Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap();
        ledger.record(measurement(40.0, now - Duration::hours(2))).unwrap();
        ledger.record(measurement(25.0, now - Duration::hours(30))).unwrap();
        ledger.record(measurement(10.0, now - Duration::hours(80))).unwrap();

        let at = Coordinate::new(-16.95, 35.25).unwrap();
        assert_eq!(ledger.total_at(&at, RainfallWindow::Hours24, now).unwrap(), 40.0);
        assert_eq!(ledger.total_at(&at, RainfallWindow::Hours72, now).unwrap(), 65.0);
    }

    #[test]
    fn test_measurements_older_than_longest_window_are_dropped() {
        let ledger = ledger_with_station();
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        ledger.record(measurement(5.0, start)).unwrap();
        ledger.record(measurement(7.0, start + Duration::hours(10))).unwrap();
        ledger.record(measurement(9.0, start + Duration::hours(80))).unwrap();

        let kept: Vec<f64> = ledger
            .state
            .read()
            .unwrap()
            .measurements
            .iter()
            .map(|m| m.rainfall_mm)
            .collect();
        assert_eq!(kept, vec![7.0, 9.0]);

        let at = Coordinate::new(-16.92, 35.26).unwrap();
        let end = start + Duration::hours(80);
        assert_eq!(ledger.total_at(&at, RainfallWindow::Hours72, end).unwrap(), 16.0);
    }

    #[test]
    fn test_negative_rainfall_is_rejected() {
        let ledger = ledger_with_station();
        let result = ledger.record(measurement(-2.0, Utc::now()));
        assert!(matches!(result, Err(FloodRiskError::InvalidInput(_))));
        let result = ledger.record(measurement(f64::INFINITY, Utc::now()));
        assert!(matches!(result, Err(FloodRiskError::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_station_is_rejected() {
        let ledger = ledger_with_station();
        let mut m = measurement(5.0, Utc::now());
        m.station_code = "ZZZ".to_string();
        assert!(matches!(ledger.record(m), Err(FloodRiskError::InvalidInput(_))));
    }

    #[test]
    fn test_far_away_coordinate_has_no_data() {
        let ledger = ledger_with_station();
        let lilongwe = Coordinate::new(-13.96, 33.77).unwrap();
        let result = ledger.rainfall(&lilongwe, RainfallWindow::Hours24);
        assert!(matches!(result, Err(SourceError::NoData(_))));
    }

    #[test]
    fn test_inactive_station_is_skipped() {
        let ledger = RainfallLedger::new(25_000.0);
        ledger.add_station(GaugeStation {
            station_code: "NSJ-01".to_string(),
            location: Coordinate::new(-16.92, 35.26).unwrap(),
            active: false,
        });
        let at = Coordinate::new(-16.92, 35.26).unwrap();
        assert!(ledger.rainfall(&at, RainfallWindow::Hours24).is_err());
    }
}
