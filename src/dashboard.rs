//! Dashboard read path: today's orders for a shop, partitioned for the operator

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::db::{orders, shops, FlowfixStatus, Order, Store};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayView {
    pub shop_id: String,
    /// UTC midnight the view starts from
    pub since: DateTime<Utc>,
    pub domestic: Vec<Order>,
    pub international: Vec<Order>,
    /// Operator action items; excluded from the other two lists
    pub needs_verification: Vec<Order>,
}

impl TodayView {
    pub fn total(&self) -> usize {
        self.domestic.len() + self.international.len() + self.needs_verification.len()
    }
}

pub struct Dashboard {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl Dashboard {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn today(&self, shop_id: &str) -> Result<TodayView> {
        let since = start_of_day(self.clock.now());
        let orders = self.store.with_conn(|conn| {
            shops::require_shop(conn, shop_id)?;
            orders::list_shop_orders_since(conn, shop_id, since)
        })?;
        Ok(partition(shop_id, since, orders))
    }
}

pub(crate) fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

fn partition(shop_id: &str, since: DateTime<Utc>, orders: Vec<Order>) -> TodayView {
    let mut view = TodayView {
        shop_id: shop_id.to_string(),
        since,
        domestic: vec![],
        international: vec![],
        needs_verification: vec![],
    };

    for order in orders {
        if order.flowfix_status == FlowfixStatus::NeedsVerification {
            view.needs_verification.push(order);
        } else if order.is_domestic {
            view.domestic.push(order);
        } else {
            view.international.push(order);
        }
    }
    view
}
