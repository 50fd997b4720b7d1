//! Timeout reconciler
//!
//! Orders left in `shipping_in_progress` past the confirmation deadline are
//! moved to `needs_verification`, and the owning shop takes an intervention.
//! The status flip, the intervention insert and the shop reset commit together
//! per order. The status flip is conditioned on the order still being stale,
//! so an overlapping pass, or a confirmation that lands first, turns it into a
//! skip rather than a second intervention.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::models::sync_status;
use crate::db::orders::{self, StartGuard, Transition};
use crate::db::{FlowfixStatus, Order, Store};
use crate::error::{Result, TrustFulfillError};
use crate::trust::{self, InterventionTrigger};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Stale orders found at the start of the pass
    pub attempted: usize,
    pub timed_out: usize,
    /// Resolved by another writer before this pass reached them
    pub skipped: usize,
    /// Left untouched; retried next pass
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(TrustFulfillError::PartialReconciliation {
                failed: self.failed.len(),
                attempted: self.attempted,
            })
        }
    }
}

pub struct TimeoutReconciler {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
    reason: String,
}

impl TimeoutReconciler {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, deadline: Duration) -> Self {
        Self {
            reason: timeout_reason(deadline),
            store,
            clock,
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one pass over every stale order
    pub fn run_once(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let cutoff = now - self.deadline;
        let stale = self
            .store
            .with_conn(|conn| orders::list_stale_in_progress(conn, cutoff))?;

        let mut report = ReconcileReport {
            attempted: stale.len(),
            ..Default::default()
        };

        for order in &stale {
            match self.reconcile_order(order, cutoff, now) {
                Ok(true) => report.timed_out += 1,
                Ok(false) => {
                    debug!(order_id = %order.id, "Order resolved elsewhere, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        order_number = %order.order_number,
                        error = %e,
                        "Failed to reconcile order, will retry next pass"
                    );
                    report.failed.push(order.id.clone());
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                timed_out = report.timed_out,
                skipped = report.skipped,
                failed = report.failed.len(),
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Time out a single order. Returns false when its precondition no longer holds.
    fn reconcile_order(&self, order: &Order, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        self.store.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let timeout = Transition::new(
                &order.id,
                FlowfixStatus::ShippingInProgress,
                FlowfixStatus::NeedsVerification,
                sync_status::TIMEOUT,
                now,
            )
            .detail(&self.reason)
            .guard(StartGuard::StartedBefore(cutoff));

            if !orders::apply_transition(&tx, &timeout)? {
                return Ok(false);
            }

            let current = orders::require_order(&tx, &order.id)?;
            let started_at = current.shipping_started_at.ok_or_else(|| {
                TrustFulfillError::Internal(format!("order {} has no shipping start", order.id))
            })?;

            let trigger = InterventionTrigger {
                shop_id: current.shop_id.clone(),
                order_id: current.id.clone(),
                order_number: current.order_number.clone(),
                reason: self.reason.clone(),
                details: Some(json!({
                    "shippingStartedAt": started_at,
                    "timeoutAfter": started_at + self.deadline,
                    "detectedAt": now,
                })),
                event_key: format!("timeout:{}:{}", current.id, started_at.timestamp_millis()),
            };
            trust::record_intervention(&tx, &trigger, now)?;

            tx.commit()?;

            warn!(
                order_id = %current.id,
                shop_id = %current.shop_id,
                order_number = %current.order_number,
                "Confirmation deadline passed, order needs verification"
            );
            Ok(true)
        })
    }
}

/// Reason string recorded on timeout interventions
pub fn timeout_reason(deadline: Duration) -> String {
    let secs = deadline.num_seconds();
    let window = match secs {
        60 => "1 minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    };
    format!("Timeout: store confirmation not received within {}", window)
}
