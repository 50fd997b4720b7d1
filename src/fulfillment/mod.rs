//! Two-phase fulfillment state machine
//!
//! ```text
//! awaiting_action ──request──▶ shipping_in_progress ──confirm──▶ shipped
//!                                  │        ▲                     ▲
//!                    timeout / api │        │ retry               │ verify
//!                                  ▼        │                     │
//!                               needs_verification ───────────────┘
//! ```
//!
//! Every transition is a conditional write on the status last read. A writer
//! whose precondition no longer holds gets `InvalidTransition` (or its own
//! no-op outcome) and the order is left untouched.

pub mod gateway;

use std::sync::Arc;

use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::models::sync_status;
use crate::db::orders::{self, StartGuard, Stamp, Transition};
use crate::db::{shops, FlowfixStatus, Order, Store};
use crate::error::{Result, TrustFulfillError};

pub use gateway::{
    DryRunGateway, ExternalFulfillmentError, FulfillmentGateway, ShopifyGateway, TrackingInfo,
};

const REQUESTABLE: &[FlowfixStatus] = &[
    FlowfixStatus::AwaitingAction,
    FlowfixStatus::NeedsVerification,
];

const MANUAL_VERIFICATION_DETAIL: &str = "Verified manually by operator";

/// Result of a fulfillment request
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Accepted by the platform; waiting for confirmation or timeout
    Requested(Order),
    /// Platform refused synchronously; order parked in `needs_verification`
    ExternalFailed {
        order: Order,
        error: ExternalFulfillmentError,
    },
}

impl RequestOutcome {
    pub fn order(&self) -> &Order {
        match self {
            Self::Requested(order) => order,
            Self::ExternalFailed { order, .. } => order,
        }
    }
}

/// Result of an external confirmation
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Confirmed(Order),
    /// Duplicate delivery; nothing written
    AlreadyShipped(Order),
}

pub struct FulfillmentService {
    store: Arc<Store>,
    gateway: Arc<dyn FulfillmentGateway>,
    clock: Arc<dyn Clock>,
}

impl FulfillmentService {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn FulfillmentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
        }
    }

    pub fn get_order(&self, order_id: &str) -> Result<Order> {
        self.store.with_conn(|conn| orders::require_order(conn, order_id))
    }

    /// Start (or retry) fulfillment.
    ///
    /// Valid from `awaiting_action` and `needs_verification`. The order is
    /// moved to `shipping_in_progress` before the platform is called, so the
    /// deadline covers the call itself.
    pub async fn request_fulfillment(&self, order_id: &str) -> Result<RequestOutcome> {
        self.request_fulfillment_with(order_id, None).await
    }

    /// [`request_fulfillment`](Self::request_fulfillment) carrying tracking
    /// details through to the platform
    pub async fn request_fulfillment_with(
        &self,
        order_id: &str,
        tracking: Option<TrackingInfo>,
    ) -> Result<RequestOutcome> {
        let started_at = self.clock.now();

        let (shop, order) = self.store.with_conn(|conn| {
            let order = orders::require_order(conn, order_id)?;
            if !REQUESTABLE.contains(&order.flowfix_status) {
                return Err(TrustFulfillError::invalid_transition(
                    order_id,
                    REQUESTABLE,
                    order.flowfix_status,
                ));
            }
            let shop = shops::require_shop(conn, &order.shop_id)?;

            let start = Transition::new(
                order_id,
                order.flowfix_status,
                FlowfixStatus::ShippingInProgress,
                sync_status::PENDING,
                started_at,
            )
            .stamp(Stamp::ShippingStarted);

            if !start_transition(conn, &start, order.flowfix_status)? {
                let current = orders::require_order(conn, order_id)?;
                return Err(TrustFulfillError::invalid_transition(
                    order_id,
                    REQUESTABLE,
                    current.flowfix_status,
                ));
            }
            Ok((shop, orders::require_order(conn, order_id)?))
        })?;

        info!(
            order_id,
            order_number = %order.order_number,
            "Fulfillment requested, awaiting confirmation"
        );

        // No store lock is held across the platform call
        let result = self
            .gateway
            .request_fulfillment(&shop, &order, tracking.as_ref())
            .await;
        let now = self.clock.now();

        match result {
            Ok(()) => {
                let accepted = Transition::new(
                    order_id,
                    FlowfixStatus::ShippingInProgress,
                    FlowfixStatus::ShippingInProgress,
                    sync_status::SUCCESS,
                    now,
                )
                .guard(StartGuard::StartedAt(started_at));

                let order = self.store.with_conn(|conn| {
                    if !orders::apply_transition(conn, &accepted)? {
                        debug!(order_id, "Order resolved before platform accepted the request");
                    }
                    orders::require_order(conn, order_id)
                })?;
                Ok(RequestOutcome::Requested(order))
            }
            Err(error) => {
                warn!(
                    order_id,
                    order_number = %order.order_number,
                    error = %error,
                    "Fulfillment request failed, needs verification"
                );

                let detail = error.to_string();
                let failed = Transition::new(
                    order_id,
                    FlowfixStatus::ShippingInProgress,
                    FlowfixStatus::NeedsVerification,
                    error.sync_status(),
                    now,
                )
                .detail(&detail)
                .retry_after(error.retry_after_secs())
                .guard(StartGuard::StartedAt(started_at));

                let order = self.store.with_conn(|conn| {
                    if !orders::apply_transition(conn, &failed)? {
                        debug!(order_id, "Order resolved before failure could be recorded");
                    }
                    orders::require_order(conn, order_id)
                })?;
                Ok(RequestOutcome::ExternalFailed { order, error })
            }
        }
    }

    /// Record an external confirmation. Duplicate confirmations are a no-op.
    pub fn confirm_fulfillment(&self, order_id: &str) -> Result<ConfirmOutcome> {
        let now = self.clock.now();
        let confirm = Transition::new(
            order_id,
            FlowfixStatus::ShippingInProgress,
            FlowfixStatus::Shipped,
            sync_status::WEBHOOK_CONFIRMED,
            now,
        )
        .stamp(Stamp::FulfillmentConfirmed);

        self.store.with_conn(|conn| {
            let applied = orders::apply_transition(conn, &confirm)?;
            let order = orders::require_order(conn, order_id)?;

            if applied {
                info!(order_id, order_number = %order.order_number, "Fulfillment confirmed");
                return Ok(ConfirmOutcome::Confirmed(order));
            }
            match order.flowfix_status {
                FlowfixStatus::Shipped => {
                    debug!(order_id, "Order already shipped, ignoring confirmation");
                    Ok(ConfirmOutcome::AlreadyShipped(order))
                }
                actual => Err(TrustFulfillError::invalid_transition(
                    order_id,
                    &[FlowfixStatus::ShippingInProgress],
                    actual,
                )),
            }
        })
    }

    /// Operator override from `needs_verification` to `shipped`.
    /// Recorded as a manual override; `fulfillment_confirmed_at` stays unset.
    pub fn mark_verified_manually(&self, order_id: &str) -> Result<Order> {
        let now = self.clock.now();
        let verify = Transition::new(
            order_id,
            FlowfixStatus::NeedsVerification,
            FlowfixStatus::Shipped,
            sync_status::MANUAL_OVERRIDE,
            now,
        )
        .detail(MANUAL_VERIFICATION_DETAIL);

        self.store.with_conn(|conn| {
            let applied = orders::apply_transition(conn, &verify)?;
            let order = orders::require_order(conn, order_id)?;
            if !applied {
                return Err(TrustFulfillError::invalid_transition(
                    order_id,
                    &[FlowfixStatus::NeedsVerification],
                    order.flowfix_status,
                ));
            }
            info!(order_id, order_number = %order.order_number, "Order verified manually");
            Ok(order)
        })
    }
}

/// Apply the start transition. Another order already in flight for the same
/// external reference counts as a failed precondition.
fn start_transition(conn: &Connection, start: &Transition<'_>, observed: FlowfixStatus) -> Result<bool> {
    match orders::apply_transition(conn, start) {
        Ok(applied) => Ok(applied),
        Err(TrustFulfillError::Database(rusqlite::Error::SqliteFailure(e, _)))
            if e.code == ErrorCode::ConstraintViolation =>
        {
            debug!(
                order_id = start.order_id,
                status = %observed,
                "External order already in flight"
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
