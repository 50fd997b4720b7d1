//! Entity definitions for shops, orders and interventions
//!
//! Timestamps are stored as INTEGER epoch milliseconds so the reconciler and
//! pattern monitor can run plain numeric range queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

// ============================================================================
// Timestamp Helpers
// ============================================================================

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

pub(crate) fn from_opt_millis(ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

// ============================================================================
// Order Status
// ============================================================================

/// Fulfillment status of an order.
///
/// `awaiting_action → shipping_in_progress → shipped | needs_verification`,
/// with `needs_verification` re-entering `shipping_in_progress` (retry) or
/// moving to `shipped` (operator override).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowfixStatus {
    AwaitingAction,
    ShippingInProgress,
    Shipped,
    NeedsVerification,
}

impl FlowfixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAction => "awaiting_action",
            Self::ShippingInProgress => "shipping_in_progress",
            Self::Shipped => "shipped",
            Self::NeedsVerification => "needs_verification",
        }
    }
}

impl fmt::Display for FlowfixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowfixStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_action" => Ok(Self::AwaitingAction),
            "shipping_in_progress" => Ok(Self::ShippingInProgress),
            "shipped" => Ok(Self::Shipped),
            "needs_verification" => Ok(Self::NeedsVerification),
            other => Err(format!("unknown flowfix status: {}", other)),
        }
    }
}

impl ToSql for FlowfixStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FlowfixStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Diagnostic tags written to `Order::last_sync_status`.
pub mod sync_status {
    pub const SUCCESS: &str = "success";
    pub const PENDING: &str = "pending";
    pub const WEBHOOK_CONFIRMED: &str = "webhook_confirmed";
    pub const TIMEOUT: &str = "timeout";
    pub const API_FAILED: &str = "api_failed";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const MANUAL_OVERRIDE: &str = "manual_override";

    /// Tags counted as sync failures by the pattern monitor.
    pub const FAILURES: &[&str] = &[TIMEOUT, API_FAILED, RATE_LIMITED, NETWORK_ERROR];
}

// ============================================================================
// Shop
// ============================================================================

/// A connected store. Owns its trust fields exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: String,
    /// Store domain on the external platform (e.g. `acme.myshopify.com`)
    pub external_store_ref: String,
    pub domestic_countries: Vec<String>,
    pub last_intervention_at: Option<DateTime<Utc>>,
    pub last_intervention_reason: Option<String>,
    /// Cached projection; see [`crate::trust::streak_hours`]
    pub current_trust_streak_hours: f64,
    pub total_interventions: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shop {
    /// Instant the current streak is measured from.
    pub fn streak_anchor(&self) -> DateTime<Utc> {
        self.last_intervention_at.unwrap_or(self.created_at)
    }

    /// Whether a shipping country counts as domestic for this shop.
    /// Orders without a country are treated as domestic.
    pub fn is_domestic(&self, country_code: Option<&str>) -> bool {
        match country_code.map(str::trim).filter(|c| !c.is_empty()) {
            None => true,
            Some(code) => self
                .domestic_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(code)),
        }
    }
}

pub fn default_domestic_countries() -> Vec<String> {
    ["US", "CA", "PR"].iter().map(|c| c.to_string()).collect()
}

// ============================================================================
// Order
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub shop_id: String,
    pub external_order_ref: String,
    pub order_number: String,
    pub flowfix_status: FlowfixStatus,
    pub shipping_started_at: Option<DateTime<Utc>>,
    pub fulfillment_confirmed_at: Option<DateTime<Utc>>,
    pub last_sync_status: String,
    pub sync_detail: Option<String>,
    pub retry_after_secs: Option<u64>,
    pub customer_name: String,
    pub customer_email: String,
    pub address_display: String,
    pub is_domestic: bool,
    /// Append-only, in arrival order
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Intervention
// ============================================================================

/// Write-once audit record of a trust reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub id: String,
    pub shop_id: String,
    pub order_id: String,
    pub order_number: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub previous_streak: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Identifies the triggering event; unique across the ledger
    pub event_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn shop(domestic: &[&str]) -> Shop {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Shop {
            id: "shop-1".into(),
            external_store_ref: "acme.myshopify.com".into(),
            domestic_countries: domestic.iter().map(|s| s.to_string()).collect(),
            last_intervention_at: None,
            last_intervention_reason: None,
            current_trust_streak_hours: 0.0,
            total_interventions: 0,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            FlowfixStatus::AwaitingAction,
            FlowfixStatus::ShippingInProgress,
            FlowfixStatus::Shipped,
            FlowfixStatus::NeedsVerification,
        ] {
            assert_eq!(status.as_str().parse::<FlowfixStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<FlowfixStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&FlowfixStatus::NeedsVerification).unwrap();
        assert_eq!(json, "\"needs_verification\"");
    }

    #[test]
    fn test_domestic_detection() {
        let shop = shop(&["US", "CA"]);
        assert!(shop.is_domestic(Some("us")));
        assert!(shop.is_domestic(Some("CA")));
        assert!(!shop.is_domestic(Some("DE")));
        assert!(shop.is_domestic(None));
        assert!(shop.is_domestic(Some("  ")));
    }

    #[test]
    fn test_default_domestic_includes_puerto_rico() {
        let codes = default_domestic_countries();
        assert_eq!(codes, vec!["US", "CA", "PR"]);

        let refs: Vec<&str> = codes.iter().map(String::as_str).collect();
        let shop = shop(&refs);
        assert!(shop.is_domestic(Some("pr")));
        assert!(!shop.is_domestic(Some("MX")));
    }

    #[test]
    fn test_streak_anchor_prefers_last_intervention() {
        let mut shop = shop(&["US"]);
        assert_eq!(shop.streak_anchor(), shop.created_at);

        let later = shop.created_at + chrono::Duration::hours(3);
        shop.last_intervention_at = Some(later);
        assert_eq!(shop.streak_anchor(), later);
    }

    #[test]
    fn test_millis_out_of_range_is_an_error() {
        assert!(from_millis(i64::MAX).is_err());
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }
}
