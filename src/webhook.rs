//! Confirmation listener
//!
//! Inbound "order fulfilled" events go through verify-then-dispatch: the
//! signature is checked against the raw body before anything is parsed, and
//! only orders still in `shipping_in_progress` are confirmed. Unmatched, late
//! and duplicate deliveries are acknowledged without effect.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::db::{orders, Store};
use crate::error::{Result, TrustFulfillError};
use crate::fulfillment::{ConfirmOutcome, FulfillmentService};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-shopify-hmac-sha256";

/// Fulfillment state that confirms an order
const FULFILLED: &str = "fulfilled";

/// Signature check over the raw request body
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, header: Option<&str>, raw_body: &[u8]) -> bool;
}

/// Base64 HMAC-SHA256 with a shared secret
pub struct HmacSignatureVerifier {
    secret: Vec<u8>,
}

impl HmacSignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signature header value for `raw_body`
    pub fn sign(&self, raw_body: &[u8]) -> String {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mut mac) => {
                mac.update(raw_body);
                BASE64.encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }
}

impl SignatureVerifier for HmacSignatureVerifier {
    fn verify(&self, header: Option<&str>, raw_body: &[u8]) -> bool {
        let Some(header) = header else {
            return false;
        };
        let Ok(signature) = BASE64.decode(header.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(raw_body);
        // Constant-time comparison
        mac.verify_slice(&signature).is_ok()
    }
}

/// Event body as sent by the store platform
#[derive(Debug, Deserialize)]
struct FulfillmentEvent {
    /// Numeric or string order id on the platform
    order_id: serde_json::Value,
    #[serde(default)]
    fulfillment_status: Option<String>,
}

impl FulfillmentEvent {
    fn external_order_ref(&self) -> Option<String> {
        match &self.order_id {
            serde_json::Value::Number(n) => Some(number_ref(n)),
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }
}

/// Largest integer an f64 holds exactly
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// Integral floats (`1001.0`) name the same order as `1001`
fn number_ref(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64_INT => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No order awaiting confirmation for this reference
    NoMatchingOrder,
    /// The event does not assert a fulfilled state
    NotFulfilled,
    /// Already shipped or timed out before the event arrived
    AlreadyResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Confirmed {
        #[serde(rename = "orderId")]
        order_id: String,
    },
    Ignored {
        reason: IgnoreReason,
    },
}

pub struct ConfirmationListener {
    verifier: Arc<dyn SignatureVerifier>,
    fulfillment: Arc<FulfillmentService>,
    store: Arc<Store>,
}

impl ConfirmationListener {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        fulfillment: Arc<FulfillmentService>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            verifier,
            fulfillment,
            store,
        }
    }

    /// Verify and dispatch one inbound event
    pub fn handle(&self, signature: Option<&str>, raw_body: &[u8]) -> Result<ConfirmationOutcome> {
        if !self.verifier.verify(signature, raw_body) {
            warn!(
                target: "security",
                has_signature = signature.is_some(),
                body_len = raw_body.len(),
                "Rejected fulfillment webhook with invalid signature"
            );
            return Err(TrustFulfillError::AuthenticationFailed(
                "invalid webhook signature".to_string(),
            ));
        }

        let event: FulfillmentEvent = serde_json::from_slice(raw_body)
            .map_err(|e| TrustFulfillError::InvalidPayload(e.to_string()))?;
        let external_ref = event.external_order_ref().ok_or_else(|| {
            TrustFulfillError::InvalidPayload("order_id must be a number or string".to_string())
        })?;

        if event.fulfillment_status.as_deref() != Some(FULFILLED) {
            debug!(
                external_order_ref = %external_ref,
                status = ?event.fulfillment_status,
                "Webhook does not assert fulfillment, ignoring"
            );
            return Ok(ConfirmationOutcome::Ignored {
                reason: IgnoreReason::NotFulfilled,
            });
        }

        let order = self
            .store
            .with_conn(|conn| orders::find_in_progress_by_external_ref(conn, &external_ref))?;
        let Some(order) = order else {
            debug!(external_order_ref = %external_ref, "No order awaiting confirmation");
            return Ok(ConfirmationOutcome::Ignored {
                reason: IgnoreReason::NoMatchingOrder,
            });
        };

        match self.fulfillment.confirm_fulfillment(&order.id) {
            Ok(ConfirmOutcome::Confirmed(order)) => {
                info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "Webhook confirmed fulfillment"
                );
                Ok(ConfirmationOutcome::Confirmed { order_id: order.id })
            }
            Ok(ConfirmOutcome::AlreadyShipped(_)) => Ok(ConfirmationOutcome::Ignored {
                reason: IgnoreReason::AlreadyResolved,
            }),
            Err(e) if e.is_invalid_transition() => {
                // Lost the race to the reconciler or another delivery
                info!(order_id = %order.id, error = %e, "Webhook arrived after order was resolved");
                Ok(ConfirmationOutcome::Ignored {
                    reason: IgnoreReason::AlreadyResolved,
                })
            }
            Err(e) => Err(e),
        }
    }
}
