/// IEM (Iowa Environmental Mesonet) rainfall source
///
/// Retrieves ASOS (Automated Surface Observing System) hourly precipitation
/// from the Iowa State University Mesonet archive and aggregates it into
/// the 24h / 72h totals the risk scorer consumes. A coordinate is served by
/// the nearest configured ASOS station within range.
///
/// API Documentation: https://mesonet.agron.iastate.edu/request/download.phtml

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{RainfallSource, RainfallWindow, SourceError};
use crate::model::Coordinate;

const IEM_BASE_URL: &str = "https://mesonet.agron.iastate.edu";

const MM_PER_INCH: f64 = 25.4;

// ============================================================================
// Station and observation types
// ============================================================================

/// An ASOS station that can serve rainfall for nearby coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct AsosStation {
    /// ICAO-style identifier, e.g. "FWLL" (Lilongwe) or "KPIA".
    pub station_id: String,
    pub location: Coordinate,
}

/// One archived METAR precipitation report.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecipObservation {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    /// Precipitation since the last routine hourly report, in inches.
    pub precip_1hr_in: Option<f64>,
}

// ============================================================================
// Rainfall source
// ============================================================================

pub struct IemRainfallSource {
    client: reqwest::blocking::Client,
    stations: Vec<AsosStation>,
    /// Stations farther than this from the coordinate are not used.
    max_station_distance_m: f64,
}

impl IemRainfallSource {
    pub fn new(
        stations: Vec<AsosStation>,
        max_station_distance_m: f64,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(IemRainfallSource {
            client,
            stations,
            max_station_distance_m,
        })
    }

    /// Nearest configured station within range of `at`.
    pub fn nearest_station(&self, at: &Coordinate) -> Option<&AsosStation> {
        nearest_station(&self.stations, at, self.max_station_distance_m)
    }
}

impl RainfallSource for IemRainfallSource {
    fn rainfall(&self, at: &Coordinate, window: RainfallWindow) -> Result<f64, SourceError> {
        let station = self.nearest_station(at).ok_or_else(|| {
            SourceError::NoData(format!(
                "no ASOS station within {:.0} m of {}",
                self.max_station_distance_m, at
            ))
        })?;

        let observations = fetch_recent_precip(&self.client, &station.station_id, window.hours())?;
        if observations.iter().all(|obs| obs.precip_1hr_in.is_none()) {
            return Err(SourceError::NoData(format!(
                "station {} reported no precipitation values in the last {}",
                station.station_id, window
            )));
        }
        Ok(total_precip_in(&observations) * MM_PER_INCH)
    }
}

pub fn nearest_station<'a>(
    stations: &'a [AsosStation],
    at: &Coordinate,
    max_distance_m: f64,
) -> Option<&'a AsosStation> {
    stations
        .iter()
        .map(|s| (s, s.location.distance_m(at)))
        .filter(|(_, d)| *d <= max_distance_m)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(s, _)| s)
}

// ============================================================================
// API Client Functions
// ============================================================================

/// Build the archive URL for the last `hours` hours of precipitation.
pub fn build_precip_url(station_id: &str, end: DateTime<Utc>, hours: i64) -> String {
    let begin = end - ChronoDuration::hours(hours);
    format!(
        "{}/cgi-bin/request/asos.py?station={}&data=p01i&year1={}&month1={}&day1={}&hour1={}&minute1={}&year2={}&month2={}&day2={}&hour2={}&minute2={}&tz=Etc/UTC&format=onlycomma&latlon=no&elev=no&missing=null&trace=null&direct=no",
        IEM_BASE_URL,
        station_id,
        begin.format("%Y"),
        begin.format("%m"),
        begin.format("%d"),
        begin.format("%H"),
        begin.format("%M"),
        end.format("%Y"),
        end.format("%m"),
        end.format("%d"),
        end.format("%H"),
        end.format("%M"),
    )
}

/// Fetch precipitation reports for the last `hours` hours.
pub fn fetch_recent_precip(
    client: &reqwest::blocking::Client,
    station_id: &str,
    hours: i64,
) -> Result<Vec<PrecipObservation>, SourceError> {
    let url = build_precip_url(station_id, Utc::now(), hours);

    let response = client.get(&url).send()?;

    if !response.status().is_success() {
        return Err(SourceError::Http(response.status().as_u16()));
    }

    let text = response.text()?;
    parse_precip_csv(&text)
}

/// Parse the IEM `onlycomma` CSV response (`station,valid,p01i`).
pub fn parse_precip_csv(csv: &str) -> Result<Vec<PrecipObservation>, SourceError> {
    let mut observations = Vec::new();

    for (i, line) in csv.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue; // Skip header or empty lines
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 {
            continue; // Skip incomplete rows
        }

        // Timestamp format: "2025-01-14 19:54"
        let timestamp = NaiveDateTime::parse_from_str(fields[1].trim(), "%Y-%m-%d %H:%M")
            .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
            .map_err(|e| SourceError::Parse(format!("bad timestamp '{}': {}", fields[1], e)))?;

        let raw = fields[2].trim();
        let precip_1hr_in = if raw == "null" || raw.is_empty() || raw == "M" {
            None
        } else {
            Some(
                raw.parse::<f64>()
                    .map_err(|e| SourceError::Parse(format!("bad p01i '{}': {}", raw, e)))?,
            )
        };

        observations.push(PrecipObservation {
            station_id: fields[0].trim().to_string(),
            timestamp,
            precip_1hr_in,
        });
    }

    Ok(observations)
}

// ============================================================================
// Precipitation Aggregation
// ============================================================================

/// Total precipitation in inches.
///
/// `p01i` accumulates from the last routine report, so special reports
/// inside the same clock hour repeat part of the routine total. Only the
/// largest value per clock hour is counted.
pub fn total_precip_in(observations: &[PrecipObservation]) -> f64 {
    let mut per_hour: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for obs in observations {
        let Some(amount) = obs.precip_1hr_in else {
            continue;
        };
        let Some(hour) = obs
            .timestamp
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
        else {
            continue;
        };
        let slot = per_hour.entry(hour).or_insert(0.0);
        if amount > *slot {
            *slot = amount;
        }
    }
    per_hour.values().sum()
}

// ============================================================================
// Tests
// ============================================================================
