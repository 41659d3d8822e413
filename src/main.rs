/// Flood risk service.
///
/// Usage:
///   `flood_risk_service [CONFIG] [--once]`
///   `flood_risk_service [CONFIG] --record STATION MM [HOURS]`
///
/// Loads the service configuration (default `flood_risk.toml`, defaults
/// used if the file does not exist) and the region registry, connects to
/// PostgreSQL via `DATABASE_URL`, then evaluates every region on the
/// configured interval. `--once` runs a single pass and exits. `--record`
/// stores one manually read gauge measurement (MM millimetres over HOURS
/// hours, default 1, ending now) and exits.
use chrono::Utc;
use std::collections::HashSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flood_risk_service::alert::manager::{AlertSink, LogSink};
use flood_risk_service::analysis::resolver::DataSources;
use flood_risk_service::config::{self, RainfallProvider, ServiceConfig};
use flood_risk_service::db::{
    self, PgAlertLog, PgAlertStore, PgRainfall, PgTerrain, PgWaterBodies, PgZoneStore,
};
use flood_risk_service::engine::{CommitOutcome, FloodRiskEngine};
use flood_risk_service::ingest::RainfallSource;
use flood_risk_service::ingest::iem::IemRainfallSource;
use flood_risk_service::ingest::ledger::RainfallMeasurement;
use flood_risk_service::logging::{self, Component};
use flood_risk_service::model::{RegionId, RiskScore};
use flood_risk_service::regions::{self, RegionRegistry};

const DEFAULT_CONFIG: &str = "flood_risk.toml";
const USAGE: &str = "usage: flood_risk_service [CONFIG] [--once]\n       flood_risk_service [CONFIG] --record STATION MM [HOURS]";

/// Limit on zone, alert and audit writes.
const STORE_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    if let Err(e) = run() {
        eprintln!("flood_risk_service: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut once = false;
    let mut record: Option<Vec<String>> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => once = true,
            "--record" => {
                record = Some(args.by_ref().collect());
                break;
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(());
            }
            path => config_path = path.to_string(),
        }
    }

    let config = if Path::new(&config_path).exists() {
        config::load_config(&config_path)?
    } else {
        println!("{} not found, using defaults", config_path);
        ServiceConfig::default()
    };

    logging::init_logger(
        config.logging.level,
        config.logging.file.as_deref(),
        config.logging.console_timestamps,
    );

    let registry = Arc::new(regions::load_regions(&config.regions_file)?);
    logging::info(
        Component::System,
        None,
        &format!(
            "Loaded {} regions from {}",
            registry.regions().len(),
            config.regions_file
        ),
    );

    let mut bootstrap = db::connect_from_env()?;
    db::ensure_schema(&mut bootstrap)?;
    logging::info(Component::System, None, "Database schema ready");

    if let Some(fields) = record {
        return record_rainfall(&config, &fields);
    }

    let engine = build_engine(&config, registry.clone())?;
    let region_ids = registry.all_region_ids();
    let mut deferred: Vec<(RegionId, RiskScore)> = Vec::new();

    loop {
        run_pass(&engine, &config, &region_ids, &mut deferred);
        if once {
            break;
        }
        thread::sleep(Duration::from_secs(config.schedule.interval_secs));
    }

    Ok(())
}

fn build_engine(
    config: &ServiceConfig,
    registry: Arc<RegionRegistry>,
) -> Result<FloodRiskEngine, Box<dyn Error>> {
    let lookup_timeout = config.engine.resolver.source_timeout();
    let lookup_client = || db::connect_with_statement_timeout(lookup_timeout).map(db::shared);
    let store_client = || db::connect_with_statement_timeout(STORE_STATEMENT_TIMEOUT).map(db::shared);

    let rainfall: Arc<dyn RainfallSource> = match config.rainfall.provider {
        RainfallProvider::Database => Arc::new(PgRainfall::new(
            lookup_client()?,
            config.rainfall.max_station_distance_m,
        )),
        RainfallProvider::Iem => Arc::new(IemRainfallSource::new(
            registry.asos_stations().to_vec(),
            config.rainfall.max_station_distance_m,
            config.engine.resolver.source_timeout(),
        )?),
    };

    let sources = DataSources {
        terrain: Arc::new(PgTerrain::new(lookup_client()?)),
        water: Arc::new(PgWaterBodies::new(lookup_client()?)),
        rainfall,
    };
    let store = Arc::new(PgZoneStore::new(store_client()?));
    let alert_store = Arc::new(PgAlertStore::new(store_client()?));
    let sinks: Vec<Box<dyn AlertSink>> = vec![
        Box::new(LogSink),
        Box::new(PgAlertLog::new(store_client()?)),
    ];

    Ok(FloodRiskEngine::with_alert_store(
        config.engine,
        sources,
        registry,
        store,
        alert_store,
        sinks,
    )?)
}

/// Stores `STATION MM [HOURS]` as a measurement ending now.
fn record_rainfall(config: &ServiceConfig, fields: &[String]) -> Result<(), Box<dyn Error>> {
    let (station_code, mm, hours) = match fields {
        [station, mm] => (station, mm, None),
        [station, mm, hours] => (station, mm, Some(hours)),
        _ => return Err(USAGE.into()),
    };
    let measurement = RainfallMeasurement {
        station_code: station_code.clone(),
        rainfall_mm: mm
            .parse()
            .map_err(|e| format!("invalid rainfall amount '{}': {}", mm, e))?,
        duration_hours: match hours {
            Some(h) => h.parse().map_err(|e| format!("invalid hours '{}': {}", h, e))?,
            None => 1,
        },
        recorded_at: Utc::now(),
    };

    let rainfall = PgRainfall::new(
        db::connect_with_statement_timeout(STORE_STATEMENT_TIMEOUT).map(db::shared)?,
        config.rainfall.max_station_distance_m,
    );
    rainfall.record(&measurement)?;
    logging::info(
        Component::Rainfall,
        Some(measurement.station_code.as_str()),
        &format!(
            "Recorded {:.1} mm over {}h",
            measurement.rainfall_mm, measurement.duration_hours
        ),
    );
    Ok(())
}

fn run_pass(
    engine: &FloodRiskEngine,
    config: &ServiceConfig,
    region_ids: &[RegionId],
    deferred: &mut Vec<(RegionId, RiskScore)>,
) {
    let now = Utc::now();

    // Commits that failed on a store outage last pass.
    let mut still_deferred = Vec::new();
    for (region_id, score) in deferred.drain(..) {
        match engine.commit_score(&region_id, score.clone()) {
            Ok(_) => logging::info(
                Component::ZoneStore,
                Some(region_id.as_str()),
                "deferred commit applied",
            ),
            Err(e) => {
                logging::warn(
                    Component::ZoneStore,
                    Some(region_id.as_str()),
                    &format!("deferred commit still failing: {}", e),
                );
                still_deferred.push((region_id, score));
            }
        }
    }
    *deferred = still_deferred;

    // Stale zones go first so a slow pass refreshes them before the rest.
    let stale: HashSet<RegionId> = match engine.stale_zones(config.schedule.stale_after_minutes, now) {
        Ok(zones) => zones.into_iter().map(|z| z.region_id).collect(),
        Err(e) => {
            logging::warn(Component::ZoneStore, None, &format!("stale zone check failed: {}", e));
            HashSet::new()
        }
    };
    for region_id in &stale {
        logging::warn(
            Component::Engine,
            Some(region_id.as_str()),
            &format!(
                "score older than {} minutes, re-scoring first",
                config.schedule.stale_after_minutes
            ),
        );
    }
    let mut ordered: Vec<RegionId> = region_ids.to_vec();
    ordered.sort_by_key(|id| !stale.contains(id));

    for result in engine.evaluate_all(&ordered, now) {
        if let Ok(evaluation) = result.result {
            if let CommitOutcome::Deferred { .. } = evaluation.outcome {
                deferred.push((result.region_id, evaluation.score));
            }
        }
    }

    let redelivered = engine.redeliver();
    if redelivered > 0 {
        logging::info(
            Component::Alerts,
            None,
            &format!("Redelivered {} alert events", redelivered),
        );
    }
}
