//! Alert lifecycle management.
//!
//! Per region state machine, driven only by committed (debounced) tier
//! changes:
//!
//! ```text
//!   NONE / RESOLVED --tier >= HIGH--------------> ACTIVE     (new alert)
//!   ACTIVE / ESCALATED --tier rises-------------> ESCALATED
//!   ACTIVE / ESCALATED --tier <= MODERATE-------> RESOLVED
//! ```
//!
//! A fall that stays at HIGH or above is recorded in the alert history
//! without a status change. Every status transition emits an `AlertEvent`.
//! State is committed before any sink sees the event; a failed delivery is
//! logged and parked in an outbox for the caller to retry.
//!
//! Every changed alert is written through an `AlertStore`. A manager built
//! with `with_store` starts from the stored alerts and continues the id
//! sequence after the highest id on record.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::logging::{self, Component};
use crate::model::{Alert, AlertEvent, AlertId, AlertStatus, RegionId, RiskTier};
use crate::store::{AlertStore, MemoryAlertStore, StoreError};

// ---------------------------------------------------------------------------
// Notification seam
// ---------------------------------------------------------------------------

pub type DeliveryError = Box<dyn Error + Send + Sync>;

/// Receives alert events for notification dispatch (SMS, email, audit log).
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError>;
}

/// Writes every event to the service log.
pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let line = format!(
            "{} {} -> {} [{}]: {}",
            event.alert_id,
            event.old_status.map(|s| s.to_string()).unwrap_or_else(|| "NONE".to_string()),
            event.new_status,
            event.tier,
            event.message
        );
        match event.new_status {
            AlertStatus::Resolved => logging::info(Component::Alerts, Some(event.region_id.as_str()), &line),
            _ => logging::warn(Component::Alerts, Some(event.region_id.as_str()), &line),
        }
        Ok(())
    }
}

/// An event one sink failed to accept.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeliveredEvent {
    pub sink: String,
    pub event: AlertEvent,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct AlertManager {
    next_id: AtomicU64,
    /// Every alert ever opened, per region, oldest first. Only the last
    /// entry can be open.
    alerts: Mutex<HashMap<RegionId, Vec<Alert>>>,
    store: Arc<dyn AlertStore>,
    sinks: Vec<Box<dyn AlertSink>>,
    undelivered: Mutex<Vec<UndeliveredEvent>>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl AlertManager {
    /// A manager whose alerts live only as long as the process.
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        AlertManager {
            next_id: AtomicU64::new(1),
            alerts: Mutex::new(HashMap::new()),
            store: Arc::new(MemoryAlertStore::new()),
            sinks,
            undelivered: Mutex::new(Vec::new()),
        }
    }

    /// Restores every alert held by `store` and persists each later change
    /// there.
    pub fn with_store(
        store: Arc<dyn AlertStore>,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Result<Self, StoreError> {
        let stored = store.load_alerts()?;
        let highest = stored
            .iter()
            .map(|a| a.id().0)
            .chain(std::iter::once(store.max_alert_id()?))
            .max()
            .unwrap_or(0);

        let open = stored.iter().filter(|a| a.is_open()).count();
        let total = stored.len();
        let mut alerts: HashMap<RegionId, Vec<Alert>> = HashMap::new();
        for alert in stored {
            alerts.entry(alert.region_id().clone()).or_default().push(alert);
        }
        for history in alerts.values_mut() {
            history.sort_by(|a, b| a.opened_at().cmp(&b.opened_at()).then(a.id().cmp(&b.id())));
        }
        logging::info(
            Component::Alerts,
            None,
            &format!(
                "Restored {} alerts ({} open), next id {}",
                total,
                open,
                highest + 1
            ),
        );

        Ok(AlertManager {
            next_id: AtomicU64::new(highest + 1),
            alerts: Mutex::new(alerts),
            store,
            sinks,
            undelivered: Mutex::new(Vec::new()),
        })
    }

    /// Current tier of the region's unresolved alert, if it has one.
    pub fn open_alert_tier(&self, region_id: &RegionId) -> Option<RiskTier> {
        lock(&self.alerts)
            .get(region_id)
            .and_then(|history| history.iter().rfind(|a| a.is_open()))
            .map(Alert::current_tier)
    }

    /// Applies a committed tier change and returns the resulting events.
    ///
    /// Callers must serialize calls per region; the engine does this with its
    /// per-region lock. A changed alert that the store rejects stays in
    /// memory and is written again with its next change.
    pub fn apply(&self, region_id: &RegionId, tier: RiskTier, at: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        let changed = {
            let mut alerts = lock(&self.alerts);
            let history = alerts.entry(region_id.clone()).or_default();
            self.transition(history, region_id, tier, at, &mut events)
        };

        if let Some(alert) = changed {
            if let Err(e) = self.store.save_alert(&alert) {
                logging::error(
                    Component::Alerts,
                    Some(region_id.as_str()),
                    &format!("{} not persisted: {}", alert.id(), e),
                );
            }
        }
        events
    }

    /// Moves the region's alert history to `tier`. Returns a copy of the
    /// alert that changed, if any.
    fn transition(
        &self,
        history: &mut Vec<Alert>,
        region_id: &RegionId,
        tier: RiskTier,
        at: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) -> Option<Alert> {
        let Some(index) = history.iter().rposition(|a| a.is_open()) else {
            if !tier.is_alerting() {
                return None;
            }
            let old_status = history.last().map(|a| a.status());
            let id = AlertId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let alert = Alert::open(id, region_id.clone(), tier, at);
            events.push(event(id, region_id, old_status, AlertStatus::Active, tier, at));
            history.push(alert.clone());
            return Some(alert);
        };

        let alert = &mut history[index];
        let old_status = alert.status();
        // Easing within the alerting tiers is history only, with no event.
        let (new_status, emits) = if !tier.is_alerting() {
            (AlertStatus::Resolved, true)
        } else if tier > alert.current_tier() {
            (AlertStatus::Escalated, true)
        } else if tier != alert.current_tier() {
            (old_status, false)
        } else {
            return None;
        };

        alert.record(tier, new_status, at);
        if emits {
            events.push(event(alert.id(), region_id, Some(old_status), new_status, tier, at));
        }
        Some(alert.clone())
    }

    /// Hands events to every sink. Failures never undo state; they are
    /// logged and kept for `drain_undelivered`.
    pub fn dispatch(&self, events: &[AlertEvent]) {
        for event in events {
            for sink in &self.sinks {
                if let Err(e) = sink.deliver(event) {
                    self.park(sink.name(), event, e.to_string());
                }
            }
        }
    }

    fn park(&self, sink: &str, event: &AlertEvent, error: String) {
        logging::warn(
            Component::Alerts,
            Some(event.region_id.as_str()),
            &format!(
                "delivery of {} to '{}' failed, kept for retry: {}",
                event.alert_id, sink, error
            ),
        );
        lock(&self.undelivered).push(UndeliveredEvent {
            sink: sink.to_string(),
            event: event.clone(),
            error,
        });
    }

    /// Removes and returns every undelivered event.
    pub fn drain_undelivered(&self) -> Vec<UndeliveredEvent> {
        std::mem::take(&mut *lock(&self.undelivered))
    }

    /// Retries every undelivered event against the sink that rejected it.
    /// Returns how many were delivered this time.
    pub fn redeliver(&self) -> usize {
        let mut delivered = 0;
        for parked in self.drain_undelivered() {
            let Some(sink) = self.sinks.iter().find(|s| s.name() == parked.sink) else {
                continue;
            };
            match sink.deliver(&parked.event) {
                Ok(()) => delivered += 1,
                Err(e) => self.park(&parked.sink, &parked.event, e.to_string()),
            }
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn collect(&self, keep: impl Fn(&Alert) -> bool) -> Vec<Alert> {
        lock(&self.alerts)
            .values()
            .flat_map(|history| history.iter())
            .filter(|a| keep(*a))
            .cloned()
            .collect()
    }

    /// Alerts that are not resolved, most severe first, then most recent.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut active = self.collect(Alert::is_open);
        active.sort_by(|a, b| {
            b.current_tier()
                .cmp(&a.current_tier())
                .then(b.opened_at().cmp(&a.opened_at()))
        });
        active
    }

    /// Every alert for the region, oldest first.
    pub fn alert_history(&self, region_id: &RegionId) -> Vec<Alert> {
        lock(&self.alerts).get(region_id).cloned().unwrap_or_default()
    }

    /// The `limit` most recently opened alerts, any status.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let mut all = self.collect(|_| true);
        all.sort_by(|a, b| b.opened_at().cmp(&a.opened_at()).then(b.id().cmp(&a.id())));
        all.truncate(limit);
        all
    }

    pub fn total_alerts(&self) -> usize {
        self.collect(|_| true).len()
    }
}

/// Locks, recovering the data if a previous holder panicked. Alerts are
/// only changed through `Alert::record`, which never leaves one half-written.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn event(
    alert_id: AlertId,
    region_id: &RegionId,
    old_status: Option<AlertStatus>,
    new_status: AlertStatus,
    tier: RiskTier,
    at: DateTime<Utc>,
) -> AlertEvent {
    let action = match new_status {
        AlertStatus::Active => "flood alert issued",
        AlertStatus::Escalated => "flood alert escalated",
        AlertStatus::Resolved => "flood alert lifted",
    };
    AlertEvent {
        alert_id,
        region_id: region_id.clone(),
        old_status,
        new_status,
        tier,
        timestamp: at,
        message: format!("{} for {}: {}", action, region_id, tier.description()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
