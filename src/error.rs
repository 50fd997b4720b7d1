//! Error types for trustfulfill

use thiserror::Error;

use crate::db::models::FlowfixStatus;

#[derive(Error, Debug)]
pub enum TrustFulfillError {
    /// The order was not in any of the statuses the transition starts from.
    /// A concurrent writer got there first; callers treat this as their no-op case.
    #[error("Invalid transition for order {order_id}: expected {expected}, found {actual}")]
    InvalidTransition {
        order_id: String,
        expected: String,
        actual: FlowfixStatus,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Reconciliation incomplete: {failed} of {attempted} orders failed, retrying next pass")]
    PartialReconciliation { failed: usize, attempted: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrustFulfillError {
    pub(crate) fn invalid_transition(
        order_id: &str,
        expected: &[FlowfixStatus],
        actual: FlowfixStatus,
    ) -> Self {
        let expected = expected
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        Self::InvalidTransition {
            order_id: order_id.to_string(),
            expected,
            actual,
        }
    }

    /// True when the error only reports a lost race on an order's status.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, TrustFulfillError>;
