//! Order ingestion from the store platform
//!
//! Orders are created once per `(shop, external ref)`. Re-ingesting an order
//! only appends notes that are not already present; status, timestamps and
//! the domestic flag are never touched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::db::orders::{self, NewOrder};
use crate::db::{shops, Order, Store};
use crate::error::{Result, TrustFulfillError};

pub const NO_ADDRESS: &str = "No address provided";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingOrder {
    pub external_order_ref: String,
    pub order_number: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShippingAddress {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub province_code: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub title: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub properties: Vec<LineItemProperty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemProperty {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created { order: Order },
    Updated {
        order: Order,
        #[serde(rename = "notesAdded")]
        notes_added: usize,
    },
}

impl IngestOutcome {
    pub fn order(&self) -> &Order {
        match self {
            Self::Created { order } | Self::Updated { order, .. } => order,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Notes from every source, in display order
pub fn aggregate_notes(incoming: &IncomingOrder) -> Vec<String> {
    let mut notes = Vec::new();

    if let Some(note) = non_empty(&incoming.note) {
        notes.push(note.to_string());
    }
    if let Some(note) = incoming.shipping_address.as_ref().and_then(|a| non_empty(&a.note)) {
        notes.push(format!("Shipping note: {}", note));
    }
    for item in &incoming.line_items {
        for prop in &item.properties {
            notes.push(format!("{}: {} = {}", item.title, prop.name, prop.value));
        }
        if let Some(note) = non_empty(&item.note) {
            notes.push(format!("{}: {}", item.title, note));
        }
    }

    notes
}

/// Multi-line display address, never truncated
pub fn format_address(address: Option<&ShippingAddress>) -> String {
    let Some(address) = address else {
        return NO_ADDRESS.to_string();
    };

    let mut lines: Vec<String> = [&address.company, &address.address1, &address.address2]
        .into_iter()
        .filter_map(non_empty)
        .map(str::to_string)
        .collect();

    let region = [non_empty(&address.province_code), non_empty(&address.zip)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let locality = match (non_empty(&address.city), region.is_empty()) {
        (Some(city), false) => format!("{}, {}", city, region),
        (Some(city), true) => city.to_string(),
        (None, _) => region,
    };
    if !locality.is_empty() {
        lines.push(locality);
    }
    if let Some(country) = non_empty(&address.country) {
        lines.push(country.to_string());
    }

    if lines.is_empty() {
        NO_ADDRESS.to_string()
    } else {
        lines.join("\n")
    }
}

fn customer_name(address: Option<&ShippingAddress>) -> String {
    address
        .map(|a| {
            format!(
                "{} {}",
                a.first_name.as_deref().unwrap_or(""),
                a.last_name.as_deref().unwrap_or("")
            )
            .trim()
            .to_string()
        })
        .unwrap_or_default()
}

pub struct OrderIngester {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl OrderIngester {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn ingest(&self, shop_id: &str, incoming: &IncomingOrder) -> Result<IngestOutcome> {
        let external_ref = incoming.external_order_ref.trim();
        if external_ref.is_empty() {
            return Err(TrustFulfillError::InvalidPayload(
                "externalOrderRef is required".to_string(),
            ));
        }

        let notes = aggregate_notes(incoming);
        let now = self.clock.now();

        self.store.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let shop = shops::require_shop(&tx, shop_id)?;

            let outcome = match orders::find_by_external_ref(&tx, shop_id, external_ref)? {
                Some(existing) => {
                    let notes_added = orders::append_notes(&tx, &existing.id, &notes)?;
                    debug!(
                        order_id = %existing.id,
                        notes_added,
                        "Order already ingested, appended notes"
                    );
                    IngestOutcome::Updated {
                        order: orders::require_order(&tx, &existing.id)?,
                        notes_added,
                    }
                }
                None => {
                    let address = incoming.shipping_address.as_ref();
                    let country = address.and_then(|a| non_empty(&a.country_code));
                    let order = orders::insert_order(
                        &tx,
                        &NewOrder {
                            id: uuid::Uuid::new_v4().to_string(),
                            shop_id: shop.id.clone(),
                            external_order_ref: external_ref.to_string(),
                            order_number: incoming.order_number.clone(),
                            customer_name: customer_name(address),
                            customer_email: incoming.email.clone().unwrap_or_default(),
                            address_display: format_address(address),
                            is_domestic: shop.is_domestic(country),
                            notes,
                            created_at: now,
                        },
                    )?;
                    info!(
                        order_id = %order.id,
                        shop_id = %shop.id,
                        order_number = %order.order_number,
                        domestic = order.is_domestic,
                        "Order ingested"
                    );
                    IngestOutcome::Created { order }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }
}
