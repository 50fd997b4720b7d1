//! HTTP surface
//!
//! Thin glue between the outside world and the core services:
//! - Store platform webhooks (fulfillment confirmations)
//! - Shop registration, order ingestion and on-demand order sync
//! - Operator actions (ship, retry, verify)
//! - Dashboard reads (today view, trust metric, intervention history)

pub mod routes;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::ErrorCode;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::clock::Clock;
use crate::dashboard::Dashboard;
use crate::db::Store;
use crate::error::TrustFulfillError;
use crate::fulfillment::{FulfillmentGateway, FulfillmentService};
use crate::ingest::OrderIngester;
use crate::sync::OrderSync;
use crate::trust::TrustLedger;
use crate::webhook::{ConfirmationListener, SignatureVerifier};

/// Services shared across handlers
pub struct AppState {
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
    pub fulfillment: Arc<FulfillmentService>,
    pub listener: ConfirmationListener,
    pub ledger: TrustLedger,
    pub dashboard: Dashboard,
    pub ingester: OrderIngester,
    pub order_sync: OrderSync,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn FulfillmentGateway>,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fulfillment = Arc::new(FulfillmentService::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
        ));
        Self {
            listener: ConfirmationListener::new(verifier, fulfillment.clone(), store.clone()),
            ledger: TrustLedger::new(store.clone(), clock.clone()),
            dashboard: Dashboard::new(store.clone(), clock.clone()),
            ingester: OrderIngester::new(store.clone(), clock.clone()),
            order_sync: OrderSync::new(store.clone(), gateway, clock.clone()),
            fulfillment,
            store,
            clock,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::status))
        // Store platform webhooks
        .route("/webhooks/orders/fulfilled", post(routes::fulfillment_webhook))
        // Shops
        .route("/api/shops", post(routes::register_shop))
        .route("/api/shops/:shop_id/orders", post(routes::ingest_order))
        .route("/api/shops/:shop_id/sync", post(routes::sync_shop))
        .route("/api/shops/:shop_id/orders/today", get(routes::today))
        .route("/api/shops/:shop_id/trust", get(routes::trust_metric))
        .route("/api/shops/:shop_id/interventions", get(routes::interventions))
        // Operator actions
        .route("/api/orders/:order_id", get(routes::get_order))
        .route("/api/orders/:order_id/ship", post(routes::ship_order))
        .route("/api/orders/:order_id/retry", post(routes::retry_order))
        .route("/api/orders/:order_id/verify", post(routes::verify_order))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response for handlers
#[derive(Debug)]
pub struct ApiError(pub TrustFulfillError);

impl From<TrustFulfillError> for ApiError {
    fn from(err: TrustFulfillError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            TrustFulfillError::NotFound(_) => StatusCode::NOT_FOUND,
            TrustFulfillError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            TrustFulfillError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            TrustFulfillError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TrustFulfillError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %self.0, "Request failed");
                "Internal server error".to_string()
            }
            StatusCode::UNAUTHORIZED => "Invalid signature".to_string(),
            StatusCode::CONFLICT if !self.0.is_invalid_transition() => {
                "Conflicts with an existing record".to_string()
            }
            _ => self.0.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
