//! Risk zone and alert persistence seams.
//!
//! The zone classifier reads and writes zones only through `ZoneStore`; the
//! alert manager persists every alert through `AlertStore` so open alerts
//! and the id sequence survive a restart. The memory implementations back
//! tests and single-process deployments; the PostgreSQL ones live in `db`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

use crate::model::{Alert, AlertId, FloodRiskError, RegionId, RiskZone};

/// A zone or alert store could not complete an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for FloodRiskError {
    fn from(err: StoreError) -> Self {
        FloodRiskError::StorageUnavailable(err.0)
    }
}

impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        StoreError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError(format!("record encoding: {}", err))
    }
}

pub trait ZoneStore: Send + Sync {
    fn load_zone(&self, region_id: &RegionId) -> Result<Option<RiskZone>, StoreError>;
    fn save_zone(&self, zone: &RiskZone) -> Result<(), StoreError>;
    /// Every stored zone, in region id order.
    fn list_zones(&self) -> Result<Vec<RiskZone>, StoreError>;
}

#[derive(Default)]
pub struct MemoryZoneStore {
    zones: RwLock<BTreeMap<RegionId, RiskZone>>,
}

impl MemoryZoneStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ZoneStore for MemoryZoneStore {
    fn load_zone(&self, region_id: &RegionId) -> Result<Option<RiskZone>, StoreError> {
        let zones = self
            .zones
            .read()
            .map_err(|_| StoreError("zone map lock poisoned".to_string()))?;
        Ok(zones.get(region_id).cloned())
    }

    fn save_zone(&self, zone: &RiskZone) -> Result<(), StoreError> {
        let mut zones = self
            .zones
            .write()
            .map_err(|_| StoreError("zone map lock poisoned".to_string()))?;
        zones.insert(zone.region_id.clone(), zone.clone());
        Ok(())
    }

    fn list_zones(&self) -> Result<Vec<RiskZone>, StoreError> {
        let zones = self
            .zones
            .read()
            .map_err(|_| StoreError("zone map lock poisoned".to_string()))?;
        Ok(zones.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

pub trait AlertStore: Send + Sync {
    /// Every stored alert, oldest id first.
    fn load_alerts(&self) -> Result<Vec<Alert>, StoreError>;
    /// Inserts the alert or replaces the stored copy with the same id.
    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    /// Highest alert id ever issued, including ids only seen in audit
    /// records. Zero when none has been.
    fn max_alert_id(&self) -> Result<u64, StoreError>;
}

#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<BTreeMap<AlertId, Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertStore for MemoryAlertStore {
    fn load_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let alerts = self
            .alerts
            .read()
            .map_err(|_| StoreError("alert map lock poisoned".to_string()))?;
        Ok(alerts.values().cloned().collect())
    }

    fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut alerts = self
            .alerts
            .write()
            .map_err(|_| StoreError("alert map lock poisoned".to_string()))?;
        alerts.insert(alert.id(), alert.clone());
        Ok(())
    }

    fn max_alert_id(&self) -> Result<u64, StoreError> {
        let alerts = self
            .alerts
            .read()
            .map_err(|_| StoreError("alert map lock poisoned".to_string()))?;
        Ok(alerts.keys().next_back().map_or(0, |id| id.0))
    }
}
