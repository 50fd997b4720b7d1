//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ApiError, SharedState};
use crate::dashboard::TodayView;
use crate::db::shops::{self, NewShop};
use crate::db::{Intervention, Order, Shop, StoreStats};
use crate::error::TrustFulfillError;
use crate::fulfillment::{RequestOutcome, TrackingInfo};
use crate::ingest::{IncomingOrder, IngestOutcome};
use crate::sync::SyncReport;
use crate::trust::TrustMetric;
use crate::webhook::{ConfirmationOutcome, SIGNATURE_HEADER};

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_INTERVENTION_LIMIT: u32 = 50;
const MAX_INTERVENTION_LIMIT: u32 = 500;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/status
pub async fn status(State(state): State<SharedState>) -> ApiResult<Json<StoreStats>> {
    Ok(Json(state.store.stats()?))
}

/// POST /webhooks/orders/fulfilled
pub async fn fulfillment_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ConfirmationOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state.listener.handle(signature, &body)?;
    Ok(Json(outcome))
}

// === Shops ===

/// POST /api/shops
pub async fn register_shop(
    State(state): State<SharedState>,
    Json(input): Json<NewShop>,
) -> ApiResult<(StatusCode, Json<Shop>)> {
    if input.external_store_ref.trim().is_empty() {
        return Err(TrustFulfillError::InvalidPayload("externalStoreRef is required".into()).into());
    }
    let now = state.clock.now();
    let shop = state
        .store
        .with_conn(|conn| shops::insert_shop(conn, &input, now))?;
    info!(shop_id = %shop.id, store = %shop.external_store_ref, "Shop registered");
    Ok((StatusCode::CREATED, Json(shop)))
}

/// POST /api/shops/:shop_id/orders
pub async fn ingest_order(
    State(state): State<SharedState>,
    Path(shop_id): Path<String>,
    Json(incoming): Json<IncomingOrder>,
) -> ApiResult<(StatusCode, Json<IngestOutcome>)> {
    let outcome = state.ingester.ingest(&shop_id, &incoming)?;
    let status = match outcome {
        IngestOutcome::Created { .. } => StatusCode::CREATED,
        IngestOutcome::Updated { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// POST /api/shops/:shop_id/sync
pub async fn sync_shop(
    State(state): State<SharedState>,
    Path(shop_id): Path<String>,
) -> ApiResult<Json<SyncReport>> {
    Ok(Json(state.order_sync.sync_shop(&shop_id).await?))
}

/// GET /api/shops/:shop_id/orders/today
pub async fn today(
    State(state): State<SharedState>,
    Path(shop_id): Path<String>,
) -> ApiResult<Json<TodayView>> {
    Ok(Json(state.dashboard.today(&shop_id)?))
}

/// GET /api/shops/:shop_id/trust
pub async fn trust_metric(
    State(state): State<SharedState>,
    Path(shop_id): Path<String>,
) -> ApiResult<Json<TrustMetric>> {
    Ok(Json(state.ledger.current_metric(&shop_id)?))
}

#[derive(Debug, Deserialize)]
pub struct InterventionQuery {
    pub limit: Option<u32>,
}

/// GET /api/shops/:shop_id/interventions
pub async fn interventions(
    State(state): State<SharedState>,
    Path(shop_id): Path<String>,
    Query(query): Query<InterventionQuery>,
) -> ApiResult<Json<Vec<Intervention>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_INTERVENTION_LIMIT)
        .clamp(1, MAX_INTERVENTION_LIMIT);
    Ok(Json(state.ledger.recent_interventions(&shop_id, limit)?))
}

// === Operator actions ===

/// Result of an operator action. A lost race is reported, not raised.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub applied: bool,
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// GET /api/orders/:order_id
pub async fn get_order(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<Order>> {
    Ok(Json(state.fulfillment.get_order(&order_id)?))
}

/// Optional body of the ship action
#[derive(Debug, Default, Deserialize)]
pub struct ShipRequest {
    #[serde(default)]
    pub tracking: Option<TrackingInfo>,
}

/// POST /api/orders/:order_id/ship
///
/// An empty body ships without tracking details.
pub async fn ship_order(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ActionResponse>> {
    let ship = if body.iter().all(u8::is_ascii_whitespace) {
        ShipRequest::default()
    } else {
        serde_json::from_slice::<ShipRequest>(&body)
            .map_err(|e| TrustFulfillError::InvalidPayload(format!("Invalid ship request: {}", e)))?
    };
    request(&state, &order_id, "ship", ship.tracking).await
}

/// POST /api/orders/:order_id/retry
pub async fn retry_order(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    request(&state, &order_id, "retry", None).await
}

async fn request(
    state: &SharedState,
    order_id: &str,
    action: &str,
    tracking: Option<TrackingInfo>,
) -> ApiResult<Json<ActionResponse>> {
    debug!(order_id, action, tracked = tracking.is_some(), "Operator requested fulfillment");
    match state
        .fulfillment
        .request_fulfillment_with(order_id, tracking)
        .await
    {
        Ok(RequestOutcome::Requested(order)) => Ok(Json(ActionResponse {
            applied: true,
            order,
            detail: None,
        })),
        Ok(RequestOutcome::ExternalFailed { order, error }) => Ok(Json(ActionResponse {
            applied: true,
            order,
            detail: Some(error.to_string()),
        })),
        Err(e) if e.is_invalid_transition() => rejected(state, order_id, e),
        Err(e) => Err(e.into()),
    }
}

/// POST /api/orders/:order_id/verify
pub async fn verify_order(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    match state.fulfillment.mark_verified_manually(&order_id) {
        Ok(order) => Ok(Json(ActionResponse {
            applied: true,
            order,
            detail: None,
        })),
        Err(e) if e.is_invalid_transition() => rejected(&state, &order_id, e),
        Err(e) => Err(e.into()),
    }
}

fn rejected(
    state: &SharedState,
    order_id: &str,
    err: TrustFulfillError,
) -> ApiResult<Json<ActionResponse>> {
    info!(order_id, error = %err, "Operator action not applied");
    let order = state.fulfillment.get_order(order_id)?;
    Ok(Json(ActionResponse {
        applied: false,
        order,
        detail: Some(err.to_string()),
    }))
}
