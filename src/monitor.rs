//! Intervention pattern monitor
//!
//! Read-only: counts recent interventions per shop and recent sync failures
//! system-wide, and raises log alerts when either crosses its threshold. A
//! shop alert is raised once per new intervention, not on every pass while
//! the window stays above the threshold.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::db::{interventions, orders, Store};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MonitorThresholds {
    /// Alert when a shop has at least this many interventions in the window
    pub shop_intervention_threshold: u64,
    pub shop_window: Duration,
    /// Alert when more than this many orders failed to sync in the window
    pub sync_failure_threshold: u64,
    pub sync_failure_window: Duration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            shop_intervention_threshold: 3,
            shop_window: Duration::hours(24),
            sync_failure_threshold: 5,
            sync_failure_window: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopAlert {
    pub shop_id: String,
    pub interventions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlert {
    pub sync_failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub shop_alerts: Vec<ShopAlert>,
    pub system_alert: Option<SystemAlert>,
}

pub struct PatternMonitor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    thresholds: MonitorThresholds,
    /// Start of the previous pass
    last_pass: Mutex<Option<DateTime<Utc>>>,
}

impl PatternMonitor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, thresholds: MonitorThresholds) -> Self {
        Self {
            store,
            clock,
            thresholds,
            last_pass: Mutex::new(None),
        }
    }

    pub fn run_once(&self) -> Result<MonitorReport> {
        let now = self.clock.now();
        let t = &self.thresholds;
        let previous_pass = self
            .last_pass
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(now);

        let (shop_counts, sync_failures) = self.store.with_conn(|conn| {
            Ok((
                interventions::counts_by_shop_since(conn, now - t.shop_window)?,
                orders::count_sync_failures_since(conn, now - t.sync_failure_window)?,
            ))
        })?;

        let shop_alerts: Vec<ShopAlert> = shop_counts
            .into_iter()
            .filter(|w| w.count >= t.shop_intervention_threshold)
            .filter(|w| previous_pass.map_or(true, |prev| w.latest >= prev))
            .map(|w| ShopAlert {
                shop_id: w.shop_id,
                interventions: w.count,
            })
            .collect();

        for alert in &shop_alerts {
            warn!(
                shop_id = %alert.shop_id,
                interventions = alert.interventions,
                window_hours = t.shop_window.num_hours(),
                "Shop has repeated interventions"
            );
        }

        let system_alert = if sync_failures > t.sync_failure_threshold {
            error!(
                sync_failures,
                window_mins = t.sync_failure_window.num_minutes(),
                "High sync failure rate across shops"
            );
            Some(SystemAlert { sync_failures })
        } else {
            None
        };

        debug!(
            shop_alerts = shop_alerts.len(),
            sync_failures, "Pattern monitor pass complete"
        );

        Ok(MonitorReport {
            shop_alerts,
            system_alert,
        })
    }
}
