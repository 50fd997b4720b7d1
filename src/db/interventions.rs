//! Intervention ledger persistence
//!
//! Rows are insert-only; the schema rejects UPDATE and DELETE with triggers.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{from_millis, to_millis, Intervention};
use crate::error::{Result, TrustFulfillError};

/// Input for recording an intervention
#[derive(Debug, Clone)]
pub struct NewIntervention {
    pub shop_id: String,
    pub order_id: String,
    pub order_number: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub previous_streak: f64,
    pub details: Option<serde_json::Value>,
    pub event_key: String,
}

fn intervention_from_row(row: &Row) -> rusqlite::Result<Intervention> {
    let details_json: Option<String> = row.get("details_json")?;
    let details = details_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Intervention {
        id: row.get("id")?,
        shop_id: row.get("shop_id")?,
        order_id: row.get("order_id")?,
        order_number: row.get("order_number")?,
        reason: row.get("reason")?,
        timestamp: from_millis(row.get("timestamp")?)?,
        previous_streak: row.get("previous_streak")?,
        details,
        event_key: row.get("event_key")?,
    })
}

/// Append an intervention. Fails on a duplicate `event_key`.
pub fn insert_intervention(conn: &Connection, input: &NewIntervention) -> Result<Intervention> {
    let id = uuid::Uuid::new_v4().to_string();
    let details_json = input
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO interventions (
            id, shop_id, order_id, order_number, reason,
            timestamp, previous_streak, details_json, event_key
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            input.shop_id,
            input.order_id,
            input.order_number,
            input.reason,
            to_millis(input.timestamp),
            input.previous_streak.max(0.0),
            details_json,
            input.event_key,
        ],
    )?;

    get_intervention(conn, &id)?.ok_or_else(|| {
        TrustFulfillError::Internal("Intervention not found after insert".to_string())
    })
}

pub fn get_intervention(conn: &Connection, id: &str) -> Result<Option<Intervention>> {
    let intervention = conn
        .query_row(
            "SELECT * FROM interventions WHERE id = ?",
            params![id],
            intervention_from_row,
        )
        .optional()?;
    Ok(intervention)
}

/// Whether an intervention already exists for a triggering event
pub fn exists_for_event(conn: &Connection, event_key: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM interventions WHERE event_key = ?",
            params![event_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Most recent interventions for a shop, newest first
pub fn list_for_shop(conn: &Connection, shop_id: &str, limit: u32) -> Result<Vec<Intervention>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM interventions WHERE shop_id = ? ORDER BY timestamp DESC, rowid DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![shop_id, limit], intervention_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Number of interventions a shop accrued strictly after `since`
pub fn count_for_shop_since(conn: &Connection, shop_id: &str, since: DateTime<Utc>) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM interventions WHERE shop_id = ? AND timestamp > ?",
        params![shop_id, to_millis(since)],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// A shop's interventions inside a time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopWindow {
    pub shop_id: String,
    pub count: u64,
    /// Timestamp of the newest intervention in the window
    pub latest: DateTime<Utc>,
}

/// Per-shop intervention counts strictly after `since`, highest first
pub fn counts_by_shop_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<ShopWindow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT shop_id, COUNT(*) AS n, MAX(timestamp) AS latest FROM interventions
        WHERE timestamp > ?
        GROUP BY shop_id
        ORDER BY n DESC, shop_id ASC
        "#,
    )?;
    let rows = stmt
        .query_map(params![to_millis(since)], |row| {
            let n: i64 = row.get("n")?;
            Ok(ShopWindow {
                shop_id: row.get("shop_id")?,
                count: n.max(0) as u64,
                latest: from_millis(row.get("latest")?)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
