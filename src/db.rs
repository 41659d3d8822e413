/// PostgreSQL-backed collaborators.
///
/// Expected layout (PostGIS enabled, all geometry in EPSG:4326):
///
/// ```text
/// flood.elevation          (location geography, elevation_m double)
/// flood.water_bodies       (name text, geom geography)
/// flood.rainfall_stations  (station_code text pk, location geography, active bool)
/// flood.rainfall_data      (station_code text, rainfall_mm double,
///                           duration_hours int, recorded_at timestamptz)
/// flood.risk_zones         (region_id text pk, tier text, score_json text,
///                           tier_since timestamptz)
/// flood.alert_events       (alert_id bigint, region_id text, old_status text,
///                           new_status text, tier text, message text,
///                           event_time timestamptz)
/// flood.alerts             (alert_id bigint pk, region_id text, status text,
///                           alert_json text, opened_at timestamptz)
/// ```
///
/// `ensure_schema` creates all of it if missing. Each collaborator holds its
/// own connection so concurrent lookups do not queue behind one another.
/// Connections opened with `connect_with_statement_timeout` have every
/// statement cancelled by the server after the limit, so a stalled query
/// releases its connection instead of holding it forever.
use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::{Client, Config, NoTls};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::alert::manager::{AlertSink, DeliveryError};
use crate::ingest::ledger::{self, RainfallMeasurement};
use crate::ingest::{RainfallSource, RainfallWindow, SourceError, TerrainSource, WaterBodyLayer};
use crate::model::{Alert, AlertEvent, Coordinate, FloodRiskError, RegionId, RiskScore, RiskTier, RiskZone};
use crate::store::{AlertStore, StoreError, ZoneStore};

/// A connection shared between threads.
pub type SharedClient = Arc<Mutex<Client>>;

/// Limit on establishing any connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects using `DATABASE_URL`, reading `.env` first if present.
pub fn connect_from_env() -> Result<Client, Box<dyn std::error::Error>> {
    connect(None)
}

/// Like `connect_from_env`, with a server-side limit on every statement.
pub fn connect_with_statement_timeout(
    limit: Duration,
) -> Result<Client, Box<dyn std::error::Error>> {
    connect(Some(limit))
}

fn connect(statement_timeout: Option<Duration>) -> Result<Client, Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL must be set (in the environment or .env)")?;
    Ok(session_config(&url, statement_timeout)?.connect(NoTls)?)
}

/// Connection settings for `url` with the service's timeouts applied.
pub fn session_config(
    url: &str,
    statement_timeout: Option<Duration>,
) -> Result<Config, postgres::Error> {
    let mut config: Config = url.parse()?;
    config.connect_timeout(CONNECT_TIMEOUT);
    if let Some(limit) = statement_timeout {
        config.options(&format!("-c statement_timeout={}", limit.as_millis().max(1)));
    }
    Ok(config)
}

pub fn shared(client: Client) -> SharedClient {
    Arc::new(Mutex::new(client))
}

pub fn ensure_schema(client: &mut Client) -> Result<(), postgres::Error> {
    client.batch_execute(
        "
        CREATE EXTENSION IF NOT EXISTS postgis;
        CREATE SCHEMA IF NOT EXISTS flood;

        CREATE TABLE IF NOT EXISTS flood.elevation (
            id          BIGSERIAL PRIMARY KEY,
            location    GEOGRAPHY(POINT, 4326) NOT NULL,
            elevation_m DOUBLE PRECISION NOT NULL
        );
        CREATE INDEX IF NOT EXISTS elevation_location_idx
            ON flood.elevation USING GIST (location);

        CREATE TABLE IF NOT EXISTS flood.water_bodies (
            id   BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            geom GEOGRAPHY NOT NULL
        );
        CREATE INDEX IF NOT EXISTS water_bodies_geom_idx
            ON flood.water_bodies USING GIST (geom);

        CREATE TABLE IF NOT EXISTS flood.rainfall_stations (
            station_code TEXT PRIMARY KEY,
            location     GEOGRAPHY(POINT, 4326) NOT NULL,
            active       BOOLEAN NOT NULL DEFAULT TRUE
        );

        CREATE TABLE IF NOT EXISTS flood.rainfall_data (
            id             BIGSERIAL PRIMARY KEY,
            station_code   TEXT NOT NULL REFERENCES flood.rainfall_stations(station_code),
            rainfall_mm    DOUBLE PRECISION NOT NULL CHECK (rainfall_mm >= 0),
            duration_hours INTEGER NOT NULL,
            recorded_at    TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS rainfall_data_station_time_idx
            ON flood.rainfall_data (station_code, recorded_at DESC);

        CREATE TABLE IF NOT EXISTS flood.risk_zones (
            region_id  TEXT PRIMARY KEY,
            tier       TEXT NOT NULL,
            score_json TEXT NOT NULL,
            tier_since TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flood.alert_events (
            id         BIGSERIAL PRIMARY KEY,
            alert_id   BIGINT NOT NULL,
            region_id  TEXT NOT NULL,
            old_status TEXT,
            new_status TEXT NOT NULL,
            tier       TEXT NOT NULL,
            message    TEXT NOT NULL,
            event_time TIMESTAMPTZ NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flood.alerts (
            alert_id   BIGINT PRIMARY KEY,
            region_id  TEXT NOT NULL,
            status     TEXT NOT NULL,
            alert_json TEXT NOT NULL,
            opened_at  TIMESTAMPTZ NOT NULL
        );
        ",
    )
}

fn with_client<T, E>(
    client: &SharedClient,
    f: impl FnOnce(&mut Client) -> Result<T, E>,
    poisoned: impl FnOnce() -> E,
) -> Result<T, E> {
    match client.lock() {
        Ok(mut c) => f(&mut c),
        Err(_) => Err(poisoned()),
    }
}

fn poisoned_source() -> SourceError {
    SourceError::Query("database connection lock poisoned".to_string())
}

// ---------------------------------------------------------------------------
// Data collaborators
// ---------------------------------------------------------------------------

/// Elevation of the nearest sample point.
pub struct PgTerrain {
    client: SharedClient,
}

impl PgTerrain {
    pub fn new(client: SharedClient) -> Self {
        PgTerrain { client }
    }
}

impl TerrainSource for PgTerrain {
    fn elevation(&self, at: &Coordinate) -> Result<f64, SourceError> {
        let rows = with_client(
            &self.client,
            |c| {
                c.query(
                    "SELECT elevation_m FROM flood.elevation
                     ORDER BY location <-> ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography
                     LIMIT 1",
                    &[&at.longitude(), &at.latitude()],
                )
                .map_err(SourceError::from)
            },
            poisoned_source,
        )?;
        rows.first()
            .map(|row| row.get::<_, f64>(0))
            .ok_or_else(|| SourceError::NoData("no elevation samples".to_string()))
    }
}

/// Geodesic distance to the nearest mapped water body.
pub struct PgWaterBodies {
    client: SharedClient,
}

impl PgWaterBodies {
    pub fn new(client: SharedClient) -> Self {
        PgWaterBodies { client }
    }
}

impl WaterBodyLayer for PgWaterBodies {
    fn nearest_distance(&self, at: &Coordinate) -> Result<f64, SourceError> {
        let row = with_client(
            &self.client,
            |c| {
                c.query_one(
                    "SELECT MIN(ST_Distance(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography))
                     FROM flood.water_bodies",
                    &[&at.longitude(), &at.latitude()],
                )
                .map_err(SourceError::from)
            },
            poisoned_source,
        )?;
        let distance: Option<f64> = row.get(0);
        distance.ok_or_else(|| SourceError::NoData("no water bodies mapped".to_string()))
    }
}

/// Rainfall total at the nearest active gauge station within range.
pub struct PgRainfall {
    client: SharedClient,
    max_station_distance_m: f64,
}

impl PgRainfall {
    pub fn new(client: SharedClient, max_station_distance_m: f64) -> Self {
        PgRainfall {
            client,
            max_station_distance_m,
        }
    }

    pub fn total_at(
        &self,
        at: &Coordinate,
        window: RainfallWindow,
        end: DateTime<Utc>,
    ) -> Result<f64, SourceError> {
        let hours = window.hours() as i32;
        let rows = with_client(
            &self.client,
            |c| {
                c.query(
                    "WITH nearest AS (
                         SELECT station_code FROM flood.rainfall_stations
                         WHERE active
                           AND ST_DWithin(location, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, $3)
                         ORDER BY location <-> ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography
                         LIMIT 1
                     )
                     SELECT n.station_code, COALESCE(SUM(d.rainfall_mm), 0)::DOUBLE PRECISION
                     FROM nearest n
                     LEFT JOIN flood.rainfall_data d
                       ON d.station_code = n.station_code
                      AND d.recorded_at >  $4::timestamptz - make_interval(hours => $5)
                      AND d.recorded_at <= $4::timestamptz
                     GROUP BY n.station_code",
                    &[
                        &at.longitude(),
                        &at.latitude(),
                        &self.max_station_distance_m,
                        &end,
                        &hours,
                    ],
                )
                .map_err(SourceError::from)
            },
            poisoned_source,
        )?;
        rows.first()
            .map(|row| row.get::<_, f64>(1))
            .ok_or_else(|| SourceError::NoData(format!("no active rain gauge near {}", at)))
    }

    /// Stores a manually reported measurement. The station must already be
    /// registered in `flood.rainfall_stations`.
    pub fn record(&self, measurement: &RainfallMeasurement) -> Result<(), FloodRiskError> {
        ledger::validate_measurement(measurement)?;
        let duration_hours = i32::try_from(measurement.duration_hours).map_err(|_| {
            FloodRiskError::InvalidInput(format!(
                "duration_hours out of range: {}",
                measurement.duration_hours
            ))
        })?;
        with_client(
            &self.client,
            |c| {
                c.execute(
                    "INSERT INTO flood.rainfall_data
                        (station_code, rainfall_mm, duration_hours, recorded_at)
                     VALUES ($1, $2, $3, $4)",
                    &[
                        &measurement.station_code,
                        &measurement.rainfall_mm,
                        &duration_hours,
                        &measurement.recorded_at,
                    ],
                )
                .map_err(|e| rejected_measurement(&measurement.station_code, e))
            },
            || FloodRiskError::StorageUnavailable("database connection lock poisoned".to_string()),
        )?;
        Ok(())
    }
}

fn rejected_measurement(station_code: &str, err: postgres::Error) -> FloodRiskError {
    match err.code() {
        Some(code) if code == &SqlState::FOREIGN_KEY_VIOLATION => {
            FloodRiskError::InvalidInput(format!("unknown rainfall station '{}'", station_code))
        }
        Some(code) if code == &SqlState::CHECK_VIOLATION => {
            FloodRiskError::InvalidInput(format!("measurement rejected: {}", err))
        }
        _ => FloodRiskError::StorageUnavailable(err.to_string()),
    }
}

impl RainfallSource for PgRainfall {
    fn rainfall(&self, at: &Coordinate, window: RainfallWindow) -> Result<f64, SourceError> {
        self.total_at(at, window, Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Zone store
// ---------------------------------------------------------------------------

pub struct PgZoneStore {
    client: SharedClient,
}

impl PgZoneStore {
    pub fn new(client: SharedClient) -> Self {
        PgZoneStore { client }
    }
}

fn poisoned_store() -> StoreError {
    StoreError("database connection lock poisoned".to_string())
}

fn zone_from_row(row: &postgres::Row) -> Result<RiskZone, StoreError> {
    let region: String = row.get(0);
    let tier: String = row.get(1);
    let score_json: String = row.get(2);
    let tier_since: DateTime<Utc> = row.get(3);

    let region_id = RegionId::parse(&region).map_err(|e| StoreError(e.to_string()))?;
    let tier: RiskTier = tier
        .parse()
        .map_err(|e: FloodRiskError| StoreError(e.to_string()))?;
    let current_score: RiskScore = serde_json::from_str(&score_json)?;

    Ok(RiskZone {
        region_id,
        tier,
        current_score,
        tier_since,
    })
}

impl ZoneStore for PgZoneStore {
    fn load_zone(&self, region_id: &RegionId) -> Result<Option<RiskZone>, StoreError> {
        let rows = with_client(
            &self.client,
            |c| {
                c.query(
                    "SELECT region_id, tier, score_json, tier_since
                     FROM flood.risk_zones WHERE region_id = $1",
                    &[&region_id.as_str()],
                )
                .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        rows.first().map(zone_from_row).transpose()
    }

    fn save_zone(&self, zone: &RiskZone) -> Result<(), StoreError> {
        let score_json = serde_json::to_string(&zone.current_score)?;
        with_client(
            &self.client,
            |c| {
                c.execute(
                    "INSERT INTO flood.risk_zones (region_id, tier, score_json, tier_since)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (region_id) DO UPDATE
                        SET tier = EXCLUDED.tier,
                            score_json = EXCLUDED.score_json,
                            tier_since = EXCLUDED.tier_since",
                    &[
                        &zone.region_id.as_str(),
                        &zone.tier.as_str(),
                        &score_json,
                        &zone.tier_since,
                    ],
                )
                .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        Ok(())
    }

    fn list_zones(&self) -> Result<Vec<RiskZone>, StoreError> {
        let rows = with_client(
            &self.client,
            |c| {
                c.query(
                    "SELECT region_id, tier, score_json, tier_since
                     FROM flood.risk_zones ORDER BY region_id",
                    &[],
                )
                .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        rows.iter().map(zone_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Alert store
// ---------------------------------------------------------------------------

/// Current state of every alert, one row per alert id.
pub struct PgAlertStore {
    client: SharedClient,
}

impl PgAlertStore {
    pub fn new(client: SharedClient) -> Self {
        PgAlertStore { client }
    }
}

impl AlertStore for PgAlertStore {
    fn load_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = with_client(
            &self.client,
            |c| {
                c.query("SELECT alert_json FROM flood.alerts ORDER BY alert_id", &[])
                    .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        rows.iter()
            .map(|row| serde_json::from_str(row.get::<_, &str>(0)).map_err(StoreError::from))
            .collect()
    }

    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let alert_json = serde_json::to_string(alert)?;
        with_client(
            &self.client,
            |c| {
                c.execute(
                    "INSERT INTO flood.alerts (alert_id, region_id, status, alert_json, opened_at)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (alert_id) DO UPDATE
                        SET status = EXCLUDED.status,
                            alert_json = EXCLUDED.alert_json",
                    &[
                        &(alert.id().0 as i64),
                        &alert.region_id().as_str(),
                        &alert.status().as_str(),
                        &alert_json,
                        &alert.opened_at(),
                    ],
                )
                .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        Ok(())
    }

    fn max_alert_id(&self) -> Result<u64, StoreError> {
        let row = with_client(
            &self.client,
            |c| {
                c.query_one(
                    "SELECT GREATEST(
                         COALESCE((SELECT MAX(alert_id) FROM flood.alerts), 0),
                         COALESCE((SELECT MAX(alert_id) FROM flood.alert_events), 0))",
                    &[],
                )
                .map_err(StoreError::from)
            },
            poisoned_store,
        )?;
        let max: i64 = row.get(0);
        Ok(max.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Alert audit log
// ---------------------------------------------------------------------------

/// Appends every alert event to `flood.alert_events`.
pub struct PgAlertLog {
    client: SharedClient,
}

impl PgAlertLog {
    pub fn new(client: SharedClient) -> Self {
        PgAlertLog { client }
    }
}

impl AlertSink for PgAlertLog {
    fn name(&self) -> &str {
        "postgres"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| "database connection lock poisoned")?;
        client.execute(
            "INSERT INTO flood.alert_events
                (alert_id, region_id, old_status, new_status, tier, message, event_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &(event.alert_id.0 as i64),
                &event.region_id.as_str(),
                &event.old_status.map(|s| s.as_str()),
                &event.new_status.as_str(),
                &event.tier.as_str(),
                &event.message,
                &event.timestamp,
            ],
        )?;
        Ok(())
    }
}
