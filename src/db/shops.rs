//! Shop persistence
//!
//! Trust fields are only ever written through [`reset_trust`] and
//! [`write_streak`], both called from the trust ledger.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::models::{from_millis, from_opt_millis, to_millis, Shop};
use crate::error::{Result, TrustFulfillError};

/// Input for registering a shop
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShop {
    #[serde(default = "new_shop_id")]
    pub id: String,
    pub external_store_ref: String,
    #[serde(default = "super::models::default_domestic_countries")]
    pub domestic_countries: Vec<String>,
}

fn new_shop_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn shop_from_row(row: &Row) -> rusqlite::Result<Shop> {
    let countries_json: String = row.get("domestic_countries_json")?;
    let domestic_countries = serde_json::from_str(&countries_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let total: i64 = row.get("total_interventions")?;

    Ok(Shop {
        id: row.get("id")?,
        external_store_ref: row.get("external_store_ref")?,
        domestic_countries,
        last_intervention_at: from_opt_millis(row.get("last_intervention_at")?)?,
        last_intervention_reason: row.get("last_intervention_reason")?,
        current_trust_streak_hours: row.get("current_trust_streak_hours")?,
        total_interventions: total.max(0) as u64,
        created_at: from_millis(row.get("created_at")?)?,
        updated_at: from_millis(row.get("updated_at")?)?,
    })
}

/// Insert a new shop with zeroed trust fields
pub fn insert_shop(conn: &Connection, input: &NewShop, now: DateTime<Utc>) -> Result<Shop> {
    let countries: Vec<String> = input
        .domestic_countries
        .iter()
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect();

    conn.execute(
        r#"
        INSERT INTO shops (id, external_store_ref, domestic_countries_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            input.id,
            input.external_store_ref,
            serde_json::to_string(&countries)?,
            to_millis(now),
            to_millis(now),
        ],
    )?;

    get_shop(conn, &input.id)?
        .ok_or_else(|| TrustFulfillError::Internal("Shop not found after insert".to_string()))
}

/// Get shop by ID
pub fn get_shop(conn: &Connection, id: &str) -> Result<Option<Shop>> {
    let shop = conn
        .query_row("SELECT * FROM shops WHERE id = ?", params![id], shop_from_row)
        .optional()?;
    Ok(shop)
}

/// Get shop by ID, failing with `NotFound` when missing
pub fn require_shop(conn: &Connection, id: &str) -> Result<Shop> {
    get_shop(conn, id)?.ok_or_else(|| TrustFulfillError::NotFound(format!("shop {}", id)))
}

/// List every shop, oldest first
pub fn list_shops(conn: &Connection) -> Result<Vec<Shop>> {
    let mut stmt = conn.prepare("SELECT * FROM shops ORDER BY created_at ASC")?;
    let shops = stmt
        .query_map([], shop_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(shops)
}

/// Reset the trust fields after an intervention.
///
/// Returns false when the shop does not exist.
pub fn reset_trust(conn: &Connection, id: &str, at: DateTime<Utc>, reason: &str) -> Result<bool> {
    let changes = conn.execute(
        r#"
        UPDATE shops SET
            last_intervention_at = ?,
            last_intervention_reason = ?,
            current_trust_streak_hours = 0,
            total_interventions = total_interventions + 1,
            updated_at = ?
        WHERE id = ?
        "#,
        params![to_millis(at), reason, to_millis(at), id],
    )?;
    Ok(changes == 1)
}

/// Write a recomputed streak, conditioned on the intervention anchor the
/// computation was based on. Returns false if a reset landed in between.
pub fn write_streak(
    conn: &Connection,
    id: &str,
    streak_hours: f64,
    expected_last_intervention_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changes = conn.execute(
        r#"
        UPDATE shops SET current_trust_streak_hours = ?, updated_at = ?
        WHERE id = ? AND last_intervention_at IS ?
        "#,
        params![
            streak_hours,
            to_millis(now),
            id,
            expected_last_intervention_at.map(to_millis),
        ],
    )?;
    Ok(changes == 1)
}
