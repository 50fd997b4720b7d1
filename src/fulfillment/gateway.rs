//! Store platform capabilities
//!
//! The core needs two things from the store platform: "fetch today's orders
//! for a shop" and "request fulfillment for this order". [`ShopifyGateway`]
//! talks to the Shopify Admin REST API; [`DryRunGateway`] accepts everything
//! for local development.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::models::sync_status;
use crate::db::{Order, Shop};
use crate::error::{Result, TrustFulfillError};
use crate::ingest::{IncomingOrder, LineItem, LineItemProperty, ShippingAddress};

/// Orders pulled per request; the platform maximum
const ORDER_PAGE_LIMIT: u32 = 250;

const ORDER_FIELDS: &str =
    "id,name,email,shipping_address,note,line_items,financial_status,fulfillment_status";

/// Carrier details forwarded with a fulfillment request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

/// Synchronous failure of a fulfillment request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalFulfillmentError {
    #[error("Rate limited by store platform")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Fulfillment rejected: {0}")]
    Rejected(String),

    #[error("Store platform unreachable: {0}")]
    Unreachable(String),
}

impl ExternalFulfillmentError {
    /// Diagnostic tag written to the order
    pub fn sync_status(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => sync_status::RATE_LIMITED,
            Self::Rejected(_) => sync_status::API_FAILED,
            Self::Unreachable(_) => sync_status::NETWORK_ERROR,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => retry_after.map(|d| d.as_secs()),
            _ => None,
        }
    }
}

/// Store platform operations the core depends on
#[async_trait::async_trait]
pub trait FulfillmentGateway: Send + Sync {
    /// Ask the platform to fulfill `order`
    async fn request_fulfillment(
        &self,
        shop: &Shop,
        order: &Order,
        tracking: Option<&TrackingInfo>,
    ) -> std::result::Result<(), ExternalFulfillmentError>;

    /// Orders created at or after `since`, any status
    async fn fetch_today_orders(
        &self,
        shop: &Shop,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<IncomingOrder>, ExternalFulfillmentError>;
}

// ============================================================================
// Shopify
// ============================================================================

pub struct ShopifyGateway {
    http_client: reqwest::Client,
    api_version: String,
    access_token: String,
}

impl ShopifyGateway {
    pub fn new(api_version: &str, access_token: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrustFulfillError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_version: api_version.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn fulfillment_url(&self, shop: &Shop, order: &Order) -> String {
        format!(
            "https://{}/admin/api/{}/orders/{}/fulfillments.json",
            shop.external_store_ref, self.api_version, order.external_order_ref
        )
    }

    fn orders_url(
        &self,
        shop: &Shop,
        since: DateTime<Utc>,
    ) -> std::result::Result<Url, ExternalFulfillmentError> {
        let base = format!(
            "https://{}/admin/api/{}/orders.json",
            shop.external_store_ref, self.api_version
        );
        Url::parse_with_params(
            &base,
            &[
                ("created_at_min", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("status", "any".to_string()),
                ("limit", ORDER_PAGE_LIMIT.to_string()),
                ("fields", ORDER_FIELDS.to_string()),
            ],
        )
        .map_err(|e| ExternalFulfillmentError::Rejected(format!("Invalid store URL {}: {}", base, e)))
    }
}

#[async_trait::async_trait]
impl FulfillmentGateway for ShopifyGateway {
    async fn request_fulfillment(
        &self,
        shop: &Shop,
        order: &Order,
        tracking: Option<&TrackingInfo>,
    ) -> std::result::Result<(), ExternalFulfillmentError> {
        let url = self.fulfillment_url(shop, order);
        debug!(order_id = %order.id, url = %url, "Requesting fulfillment");

        let response = self
            .http_client
            .post(&url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(&fulfillment_body(tracking))
            .send()
            .await
            .map_err(|e| ExternalFulfillmentError::Unreachable(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        classify_response(status, &headers, &body)
    }

    async fn fetch_today_orders(
        &self,
        shop: &Shop,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<IncomingOrder>, ExternalFulfillmentError> {
        let url = self.orders_url(shop, since)?;
        debug!(shop = %shop.external_store_ref, %since, "Fetching orders");

        let response = self
            .http_client
            .get(url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .send()
            .await
            .map_err(|e| ExternalFulfillmentError::Unreachable(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ExternalFulfillmentError::Unreachable(e.to_string()))?;

        classify_response(status, &headers, &body)?;
        parse_orders(&body)
    }
}

/// Request body for a fulfillment
pub(crate) fn fulfillment_body(tracking: Option<&TrackingInfo>) -> Value {
    let mut fulfillment = json!({ "notify_customer": true });
    if let Some(tracking) = tracking {
        fulfillment["tracking_info"] = json!(tracking);
    }
    json!({ "fulfillment": fulfillment })
}

// ============================================================================
// Order pull
// ============================================================================

#[derive(Debug, Deserialize)]
struct OrdersPage {
    #[serde(default)]
    orders: Vec<PlatformOrder>,
}

#[derive(Debug, Deserialize)]
struct PlatformOrder {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    shipping_address: Option<PlatformAddress>,
    #[serde(default)]
    line_items: Vec<PlatformLineItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlatformAddress {
    first_name: Option<String>,
    last_name: Option<String>,
    company: Option<String>,
    address1: Option<String>,
    address2: Option<String>,
    city: Option<String>,
    province_code: Option<String>,
    zip: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformLineItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    properties: Vec<PlatformProperty>,
}

#[derive(Debug, Deserialize)]
struct PlatformProperty {
    name: String,
    #[serde(default)]
    value: Value,
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl From<PlatformAddress> for ShippingAddress {
    fn from(a: PlatformAddress) -> Self {
        Self {
            first_name: a.first_name,
            last_name: a.last_name,
            company: a.company,
            address1: a.address1,
            address2: a.address2,
            city: a.city,
            province_code: a.province_code,
            zip: a.zip,
            country: a.country,
            country_code: a.country_code,
            note: a.note,
        }
    }
}

impl PlatformOrder {
    fn into_incoming(self) -> Option<IncomingOrder> {
        let external_order_ref = value_text(&self.id).filter(|id| !id.trim().is_empty())?;
        Some(IncomingOrder {
            external_order_ref,
            order_number: self.name,
            email: self.email,
            note: self.note,
            shipping_address: self.shipping_address.map(ShippingAddress::from),
            line_items: self
                .line_items
                .into_iter()
                .map(|item| LineItem {
                    title: item.title,
                    note: item.note,
                    properties: item
                        .properties
                        .into_iter()
                        .map(|p| LineItemProperty {
                            value: value_text(&p.value).unwrap_or_default(),
                            name: p.name,
                        })
                        .collect(),
                })
                .collect(),
        })
    }
}

/// Decode an orders page into ingestible orders. Orders without an id are dropped.
pub(crate) fn parse_orders(
    body: &str,
) -> std::result::Result<Vec<IncomingOrder>, ExternalFulfillmentError> {
    let page: OrdersPage = serde_json::from_str(body)
        .map_err(|e| ExternalFulfillmentError::Rejected(format!("Malformed orders payload: {}", e)))?;
    Ok(page
        .orders
        .into_iter()
        .filter_map(PlatformOrder::into_incoming)
        .collect())
}

/// Map a platform response onto the capability contract
pub(crate) fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> std::result::Result<(), ExternalFulfillmentError> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::from_secs(secs.ceil() as u64));
        return Err(ExternalFulfillmentError::RateLimited { retry_after });
    }

    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        let mut snippet: String = body.trim().chars().take(200).collect();
        if body.trim().chars().count() > 200 {
            snippet.push_str("...");
        }
        format!("HTTP {}: {}", status.as_u16(), snippet)
    };
    Err(ExternalFulfillmentError::Rejected(detail))
}

// ============================================================================
// Dry run
// ============================================================================

/// Accepts every request without calling out
#[derive(Debug, Default)]
pub struct DryRunGateway;

#[async_trait::async_trait]
impl FulfillmentGateway for DryRunGateway {
    async fn request_fulfillment(
        &self,
        shop: &Shop,
        order: &Order,
        tracking: Option<&TrackingInfo>,
    ) -> std::result::Result<(), ExternalFulfillmentError> {
        info!(
            shop = %shop.external_store_ref,
            order_number = %order.order_number,
            tracking = tracking.and_then(|t| t.number.as_deref()),
            "Dry run: fulfillment request accepted"
        );
        Ok(())
    }

    async fn fetch_today_orders(
        &self,
        shop: &Shop,
        _since: DateTime<Utc>,
    ) -> std::result::Result<Vec<IncomingOrder>, ExternalFulfillmentError> {
        debug!(shop = %shop.external_store_ref, "Dry run: no orders to fetch");
        Ok(Vec::new())
    }
}
