//! Order pull from the store platform
//!
//! Today's orders for each shop are fetched and fed through the ingester.
//! Ingestion is idempotent per `(shop, external order ref)`, so re-syncing an
//! order only appends notes it has not seen yet and never touches its
//! fulfillment status. A shop whose fetch fails, or an order that fails to
//! ingest, is logged and counted; the rest of the pass continues.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dashboard::start_of_day;
use crate::db::{shops, Shop, Store};
use crate::error::Result;
use crate::fulfillment::FulfillmentGateway;
use crate::ingest::{IngestOutcome, OrderIngester};

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub shops: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub notes_added: usize,
    /// Shops whose fetch failed; retried next pass
    pub failed_shops: Vec<String>,
    pub failed_orders: usize,
}

pub struct OrderSync {
    store: Arc<Store>,
    gateway: Arc<dyn FulfillmentGateway>,
    ingester: OrderIngester,
    clock: Arc<dyn Clock>,
}

impl OrderSync {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn FulfillmentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ingester: OrderIngester::new(store.clone(), clock.clone()),
            store,
            gateway,
            clock,
        }
    }

    /// Sync every registered shop
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let shops = self.store.with_conn(shops::list_shops)?;
        self.sync(shops).await
    }

    /// Sync a single shop; unknown shops are `NotFound`
    pub async fn sync_shop(&self, shop_id: &str) -> Result<SyncReport> {
        let shop = self.store.with_conn(|conn| shops::require_shop(conn, shop_id))?;
        self.sync(vec![shop]).await
    }

    async fn sync(&self, shops: Vec<Shop>) -> Result<SyncReport> {
        let since = start_of_day(self.clock.now());
        let mut report = SyncReport {
            shops: shops.len(),
            ..Default::default()
        };

        for shop in &shops {
            let incoming = match self.gateway.fetch_today_orders(shop, since).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(
                        shop_id = %shop.id,
                        store = %shop.external_store_ref,
                        error = %e,
                        "Order fetch failed"
                    );
                    report.failed_shops.push(shop.id.clone());
                    continue;
                }
            };
            report.fetched += incoming.len();

            for order in &incoming {
                match self.ingester.ingest(&shop.id, order) {
                    Ok(IngestOutcome::Created { .. }) => report.created += 1,
                    Ok(IngestOutcome::Updated { notes_added, .. }) => {
                        report.updated += 1;
                        report.notes_added += notes_added;
                    }
                    Err(e) => {
                        warn!(
                            shop_id = %shop.id,
                            external_order_ref = %order.external_order_ref,
                            error = %e,
                            "Order ingest failed"
                        );
                        report.failed_orders += 1;
                    }
                }
            }
            debug!(shop_id = %shop.id, fetched = incoming.len(), "Shop synced");
        }

        if report.created > 0 || report.notes_added > 0 || !report.failed_shops.is_empty() {
            info!(
                shops = report.shops,
                created = report.created,
                notes_added = report.notes_added,
                failed_shops = report.failed_shops.len(),
                "Order sync pass complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::orders;
    use crate::db::shops::NewShop;
    use crate::db::{FlowfixStatus, Order};
    use crate::fulfillment::{ExternalFulfillmentError, FulfillmentService, TrackingInfo};
    use crate::ingest::{IncomingOrder, LineItem, LineItemProperty};
    use crate::TrustFulfillError;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    /// Serves a fixed order list per store; stores listed in `down` fail
    #[derive(Default)]
    struct ScriptedStore {
        orders: Mutex<Vec<IncomingOrder>>,
        down: Vec<String>,
        since_seen: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl FulfillmentGateway for ScriptedStore {
        async fn request_fulfillment(
            &self,
            _shop: &Shop,
            _order: &Order,
            _tracking: Option<&TrackingInfo>,
        ) -> std::result::Result<(), ExternalFulfillmentError> {
            Ok(())
        }

        async fn fetch_today_orders(
            &self,
            shop: &Shop,
            since: DateTime<Utc>,
        ) -> std::result::Result<Vec<IncomingOrder>, ExternalFulfillmentError> {
            self.since_seen.lock().unwrap().push(since);
            if self.down.contains(&shop.external_store_ref) {
                return Err(ExternalFulfillmentError::Unreachable("connection refused".into()));
            }
            Ok(self.orders.lock().unwrap().clone())
        }
    }

    fn afternoon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 15, 30, 0).unwrap()
    }

    fn order(external: &str, note: &str) -> IncomingOrder {
        IncomingOrder {
            external_order_ref: external.into(),
            order_number: format!("#{}", external),
            email: Some("buyer@example.com".into()),
            note: Some(note.into()),
            shipping_address: None,
            line_items: vec![LineItem {
                title: "Mug".into(),
                note: None,
                properties: vec![LineItemProperty {
                    name: "Color".into(),
                    value: "Blue".into(),
                }],
            }],
        }
    }

    fn setup(gateway: ScriptedStore, stores: &[(&str, &str)]) -> (Arc<Store>, Arc<ScriptedStore>, OrderSync) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for (id, domain) in stores {
            store
                .with_conn(|conn| {
                    shops::insert_shop(
                        conn,
                        &NewShop {
                            id: id.to_string(),
                            external_store_ref: domain.to_string(),
                            domestic_countries: vec!["US".into()],
                        },
                        afternoon(),
                    )
                })
                .unwrap();
        }
        let gateway = Arc::new(gateway);
        let clock = Arc::new(ManualClock::new(afternoon()));
        let sync = OrderSync::new(store.clone(), gateway.clone(), clock);
        (store, gateway, sync)
    }

    fn stored(store: &Store, shop_id: &str, external: &str) -> Order {
        store
            .with_conn(|conn| orders::find_by_external_ref(conn, shop_id, external))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetches_from_start_of_day() {
        let (_store, gateway, sync) = setup(ScriptedStore::default(), &[("shop-1", "acme.myshopify.com")]);

        sync.sync_all().await.unwrap();
        assert_eq!(
            gateway.since_seen.lock().unwrap().as_slice(),
            [Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_resync_is_idempotent_and_only_appends_notes() {
        let gateway = ScriptedStore {
            orders: Mutex::new(vec![order("1001", "Gift wrap"), order("1002", "Leave at door")]),
            ..Default::default()
        };
        let (store, gateway, sync) = setup(gateway, &[("shop-1", "acme.myshopify.com")]);

        let first = sync.sync_all().await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.updated, 0);

        // Order moves along between passes
        let fulfillment = FulfillmentService::new(
            store.clone(),
            gateway.clone(),
            Arc::new(ManualClock::new(afternoon())),
        );
        let in_progress = stored(&store, "shop-1", "1001");
        fulfillment.request_fulfillment(&in_progress.id).await.unwrap();

        let unchanged = sync.sync_all().await.unwrap();
        assert_eq!(unchanged.created, 0);
        assert_eq!(unchanged.updated, 2);
        assert_eq!(unchanged.notes_added, 0);

        // The buyer edits the order note on the platform
        gateway.orders.lock().unwrap()[0].note = Some("Gift wrap, no receipt".into());
        let edited = sync.sync_all().await.unwrap();
        assert_eq!(edited.created, 0);
        assert_eq!(edited.notes_added, 1);

        let order = stored(&store, "shop-1", "1001");
        assert_eq!(order.flowfix_status, FlowfixStatus::ShippingInProgress);
        assert_eq!(order.shipping_started_at, Some(afternoon()));
        assert_eq!(
            order.notes,
            ["Gift wrap", "Mug: Color = Blue", "Gift wrap, no receipt"]
        );
        assert_eq!(store.stats().unwrap().order_count, 2);
    }

    #[tokio::test]
    async fn test_failed_shop_does_not_stop_the_pass() {
        let gateway = ScriptedStore {
            orders: Mutex::new(vec![order("1001", "Gift wrap")]),
            down: vec!["down.myshopify.com".into()],
            ..Default::default()
        };
        let (store, _gateway, sync) = setup(
            gateway,
            &[("shop-down", "down.myshopify.com"), ("shop-up", "up.myshopify.com")],
        );

        let report = sync.sync_all().await.unwrap();
        assert_eq!(report.shops, 2);
        assert_eq!(report.failed_shops, ["shop-down"]);
        assert_eq!(report.created, 1);
        assert_eq!(stored(&store, "shop-up", "1001").order_number, "#1001");
    }

    #[tokio::test]
    async fn test_order_without_reference_is_counted_not_fatal() {
        let gateway = ScriptedStore {
            orders: Mutex::new(vec![order("  ", "blank"), order("1001", "ok")]),
            ..Default::default()
        };
        let (_store, _gateway, sync) = setup(gateway, &[("shop-1", "acme.myshopify.com")]);

        let report = sync.sync_shop("shop-1").await.unwrap();
        assert_eq!(report.failed_orders, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn test_unknown_shop_is_not_found() {
        let (_store, _gateway, sync) = setup(ScriptedStore::default(), &[]);
        let err = sync.sync_shop("missing").await.unwrap_err();
        assert!(matches!(err, TrustFulfillError::NotFound(_)));
    }
}
