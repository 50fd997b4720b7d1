//! Trust ledger
//!
//! A shop's streak is the time since its last intervention (or since the shop
//! was created). The stored `current_trust_streak_hours` is a cache of that
//! formula: every intervention resets it through [`record_intervention`], and
//! the periodic [`TrustLedger::recompute_all`] refreshes it in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::interventions::{self, NewIntervention};
use crate::db::{shops, Intervention, Shop, Store};
use crate::error::{Result, TrustFulfillError};

const MILLIS_PER_HUNDREDTH_HOUR: i64 = 36_000;

/// Hours from `anchor` to `now`, floored to 0.01h and never negative.
pub fn streak_hours(anchor: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed_ms = (now - anchor).num_milliseconds().max(0);
    (elapsed_ms / MILLIS_PER_HUNDREDTH_HOUR) as f64 / 100.0
}

/// Event that resets a shop's trust streak
#[derive(Debug, Clone)]
pub struct InterventionTrigger {
    pub shop_id: String,
    pub order_id: String,
    pub order_number: String,
    pub reason: String,
    pub details: Option<serde_json::Value>,
    /// Unique per triggering event (e.g. `timeout:{order}:{started_ms}`)
    pub event_key: String,
}

/// Record an intervention and reset the shop's trust fields.
///
/// This is the single write path for every intervention source. Callers that
/// pair it with a status change run both inside one transaction.
pub fn record_intervention(
    conn: &Connection,
    trigger: &InterventionTrigger,
    now: DateTime<Utc>,
) -> Result<Intervention> {
    let shop = shops::require_shop(conn, &trigger.shop_id)?;
    let previous_streak = streak_hours(shop.streak_anchor(), now);

    let intervention = interventions::insert_intervention(
        conn,
        &NewIntervention {
            shop_id: shop.id.clone(),
            order_id: trigger.order_id.clone(),
            order_number: trigger.order_number.clone(),
            reason: trigger.reason.clone(),
            timestamp: now,
            previous_streak,
            details: trigger.details.clone(),
            event_key: trigger.event_key.clone(),
        },
    )?;

    if !shops::reset_trust(conn, &shop.id, now, &trigger.reason)? {
        return Err(TrustFulfillError::NotFound(format!("shop {}", shop.id)));
    }

    info!(
        shop_id = %shop.id,
        order_number = %trigger.order_number,
        previous_streak,
        reason = %trigger.reason,
        "Trust streak reset"
    );

    Ok(intervention)
}

/// Current trust metric for a shop, computed at read time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustMetric {
    pub shop_id: String,
    pub streak_hours: f64,
    pub last_intervention_at: Option<DateTime<Utc>>,
    pub last_intervention_reason: Option<String>,
    pub total_interventions: u64,
}

/// Result of one recompute pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakReport {
    pub shops: usize,
    pub updated: usize,
    /// Shops reset between read and write; picked up next pass
    pub skipped: usize,
}

/// Periodic streak recomputation and read-side metric
pub struct TrustLedger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl TrustLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Recompute and write back every shop's streak
    pub fn recompute_all(&self) -> Result<StreakReport> {
        let now = self.clock.now();
        let shops = self.store.with_conn(shops::list_shops)?;
        let report = self.write_back(shops, now);

        info!(
            shops = report.shops,
            updated = report.updated,
            skipped = report.skipped,
            "Trust streaks recomputed"
        );
        Ok(report)
    }

    /// Write each shop's streak as computed from the snapshot `shops`
    fn write_back(&self, shops: Vec<Shop>, now: DateTime<Utc>) -> StreakReport {
        let mut report = StreakReport {
            shops: shops.len(),
            ..Default::default()
        };

        for shop in shops {
            let streak = streak_hours(shop.streak_anchor(), now);
            let written = self.store.with_conn(|conn| {
                shops::write_streak(conn, &shop.id, streak, shop.last_intervention_at, now)
            });

            match written {
                Ok(true) => {
                    debug!(shop_id = %shop.id, streak, "Streak updated");
                    report.updated += 1;
                }
                Ok(false) => {
                    debug!(shop_id = %shop.id, "Shop changed during recompute, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(shop_id = %shop.id, error = %e, "Failed to write streak");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// The shop's trust metric as of now
    pub fn current_metric(&self, shop_id: &str) -> Result<TrustMetric> {
        let shop = self.store.with_conn(|conn| shops::require_shop(conn, shop_id))?;
        Ok(TrustMetric {
            streak_hours: streak_hours(shop.streak_anchor(), self.clock.now()),
            shop_id: shop.id,
            last_intervention_at: shop.last_intervention_at,
            last_intervention_reason: shop.last_intervention_reason,
            total_interventions: shop.total_interventions,
        })
    }

    /// Most recent interventions for a shop, newest first
    pub fn recent_interventions(&self, shop_id: &str, limit: u32) -> Result<Vec<Intervention>> {
        self.store.with_conn(|conn| {
            shops::require_shop(conn, shop_id)?;
            interventions::list_for_shop(conn, shop_id, limit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::shops::NewShop;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Arc<Store>, Arc<ManualClock>, TrustLedger) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .with_conn(|conn| {
                shops::insert_shop(
                    conn,
                    &NewShop {
                        id: "shop-1".into(),
                        external_store_ref: "acme.myshopify.com".into(),
                        domestic_countries: vec!["US".into()],
                    },
                    t0(),
                )
            })
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = TrustLedger::new(store.clone(), clock.clone());
        (store, clock, ledger)
    }

    fn trigger(key: &str) -> InterventionTrigger {
        InterventionTrigger {
            shop_id: "shop-1".into(),
            order_id: "o-1".into(),
            order_number: "#1001".into(),
            reason: "Timeout".into(),
            details: None,
            event_key: key.into(),
        }
    }

    #[test]
    fn test_streak_hours_truncates_to_hundredths() {
        let anchor = t0();
        assert_eq!(streak_hours(anchor, anchor + Duration::hours(10)), 10.0);
        // 1h 0m 35.999s is still 1.00h
        assert_eq!(
            streak_hours(anchor, anchor + Duration::milliseconds(3_635_999)),
            1.0
        );
        assert_eq!(streak_hours(anchor, anchor + Duration::seconds(36)), 0.01);
        assert_eq!(streak_hours(anchor, anchor + Duration::minutes(90)), 1.5);
        assert_eq!(streak_hours(anchor, anchor - Duration::hours(1)), 0.0);
    }

    #[test]
    fn test_recompute_from_creation_time() {
        let (store, clock, ledger) = setup();
        clock.advance(Duration::hours(10));

        let report = ledger.recompute_all().unwrap();
        assert_eq!(report, StreakReport { shops: 1, updated: 1, skipped: 0 });

        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.current_trust_streak_hours, 10.0);

        // Idempotent and monotonic
        clock.advance(Duration::minutes(30));
        ledger.recompute_all().unwrap();
        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.current_trust_streak_hours, 10.5);
    }

    #[test]
    fn test_recompute_after_intervention_measures_from_reset() {
        let (store, clock, ledger) = setup();
        clock.advance(Duration::hours(5));
        let reset_at = clock.now();
        store
            .with_conn(|conn| record_intervention(conn, &trigger("k1"), reset_at))
            .unwrap();

        clock.advance(Duration::hours(2) + Duration::seconds(59));
        let report = ledger.recompute_all().unwrap();
        assert_eq!(report, StreakReport { shops: 1, updated: 1, skipped: 0 });

        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.last_intervention_at, Some(reset_at));
        assert_eq!(shop.current_trust_streak_hours, 2.01);
    }

    #[test]
    fn test_reset_between_read_and_write_is_not_overwritten() {
        let (store, clock, ledger) = setup();
        clock.advance(Duration::hours(8));

        let snapshot = store.with_conn(shops::list_shops).unwrap();
        store
            .with_conn(|conn| record_intervention(conn, &trigger("k1"), clock.now()))
            .unwrap();

        let report = ledger.write_back(snapshot, clock.now());
        assert_eq!(report, StreakReport { shops: 1, updated: 0, skipped: 1 });

        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.current_trust_streak_hours, 0.0);
        assert_eq!(shop.total_interventions, 1);

        // The next full pass picks the shop back up from the reset
        clock.advance(Duration::minutes(30));
        ledger.recompute_all().unwrap();
        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.current_trust_streak_hours, 0.5);
    }

    #[test]
    fn test_record_intervention_resets_and_captures_previous_streak() {
        let (store, clock, ledger) = setup();
        clock.advance(Duration::hours(6));

        let recorded = store
            .with_conn(|conn| record_intervention(conn, &trigger("k1"), clock.now()))
            .unwrap();
        assert_eq!(recorded.previous_streak, 6.0);

        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.total_interventions, 1);
        assert_eq!(shop.current_trust_streak_hours, 0.0);
        assert_eq!(shop.last_intervention_at, Some(clock.now()));
        assert_eq!(shop.last_intervention_reason.as_deref(), Some("Timeout"));

        clock.advance(Duration::hours(2));
        let metric = ledger.current_metric("shop-1").unwrap();
        assert_eq!(metric.streak_hours, 2.0);
        assert_eq!(metric.total_interventions, 1);
    }

    #[test]
    fn test_same_event_never_recorded_twice() {
        let (store, clock, _ledger) = setup();
        store
            .with_conn(|conn| record_intervention(conn, &trigger("k1"), clock.now()))
            .unwrap();
        assert!(store
            .with_conn(|conn| record_intervention(conn, &trigger("k1"), clock.now()))
            .is_err());

        let shop = store.with_conn(|c| shops::require_shop(c, "shop-1")).unwrap();
        assert_eq!(shop.total_interventions, 1);
    }

    #[test]
    fn test_unknown_shop_is_not_found() {
        let (store, clock, ledger) = setup();
        let mut missing = trigger("k1");
        missing.shop_id = "nope".into();

        let err = store
            .with_conn(|conn| record_intervention(conn, &missing, clock.now()))
            .unwrap_err();
        assert!(matches!(err, TrustFulfillError::NotFound(_)));
        assert!(ledger.recent_interventions("nope", 10).is_err());
    }
}
