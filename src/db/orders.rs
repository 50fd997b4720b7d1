//! Order persistence and conditional status transitions

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::debug;

use super::models::{from_millis, from_opt_millis, sync_status, to_millis, FlowfixStatus, Order};
use crate::error::{Result, TrustFulfillError};

/// Input for inserting an order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: String,
    pub shop_id: String,
    pub external_order_ref: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub address_display: String,
    pub is_domestic: bool,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn order_from_row(row: &Row) -> rusqlite::Result<Order> {
    let retry_after: Option<i64> = row.get("retry_after_secs")?;
    Ok(Order {
        id: row.get("id")?,
        shop_id: row.get("shop_id")?,
        external_order_ref: row.get("external_order_ref")?,
        order_number: row.get("order_number")?,
        flowfix_status: row.get("flowfix_status")?,
        shipping_started_at: from_opt_millis(row.get("shipping_started_at")?)?,
        fulfillment_confirmed_at: from_opt_millis(row.get("fulfillment_confirmed_at")?)?,
        last_sync_status: row.get("last_sync_status")?,
        sync_detail: row.get("sync_detail")?,
        retry_after_secs: retry_after.map(|s| s.max(0) as u64),
        customer_name: row.get("customer_name")?,
        customer_email: row.get("customer_email")?,
        address_display: row.get("address_display")?,
        is_domestic: row.get("is_domestic")?,
        notes: vec![], // Loaded separately
        created_at: from_millis(row.get("created_at")?)?,
        updated_at: from_millis(row.get("updated_at")?)?,
    })
}

/// Run an order SELECT and attach notes to every row
fn query_orders(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, order_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut orders = Vec::with_capacity(rows.len());
    for mut order in rows {
        order.notes = get_notes(conn, &order.id)?;
        orders.push(order);
    }
    Ok(orders)
}

fn query_one(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Order>> {
    let order = conn.query_row(sql, params, order_from_row).optional()?;
    match order {
        Some(mut order) => {
            order.notes = get_notes(conn, &order.id)?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

/// Insert an order in `awaiting_action`
pub fn insert_order(conn: &Connection, input: &NewOrder) -> Result<Order> {
    let created = to_millis(input.created_at);
    conn.execute(
        r#"
        INSERT INTO orders (
            id, shop_id, external_order_ref, order_number,
            flowfix_status, last_sync_status,
            customer_name, customer_email, address_display, is_domestic,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.id,
            input.shop_id,
            input.external_order_ref,
            input.order_number,
            FlowfixStatus::AwaitingAction,
            sync_status::SUCCESS,
            input.customer_name,
            input.customer_email,
            input.address_display,
            input.is_domestic,
            created,
            created,
        ],
    )?;

    append_notes(conn, &input.id, &input.notes)?;

    get_order(conn, &input.id)?
        .ok_or_else(|| TrustFulfillError::Internal("Order not found after insert".to_string()))
}

/// Get order by ID
pub fn get_order(conn: &Connection, id: &str) -> Result<Option<Order>> {
    query_one(conn, "SELECT * FROM orders WHERE id = ?", &[&id as &dyn ToSql])
}

/// Get order by ID, failing with `NotFound` when missing
pub fn require_order(conn: &Connection, id: &str) -> Result<Order> {
    get_order(conn, id)?.ok_or_else(|| TrustFulfillError::NotFound(format!("order {}", id)))
}

/// Look up a shop's order by its external reference
pub fn find_by_external_ref(
    conn: &Connection,
    shop_id: &str,
    external_order_ref: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        "SELECT * FROM orders WHERE shop_id = ? AND external_order_ref = ?",
        &[&shop_id as &dyn ToSql, &external_order_ref],
    )
}

/// The order currently awaiting external confirmation for `external_order_ref`, if any
pub fn find_in_progress_by_external_ref(
    conn: &Connection,
    external_order_ref: &str,
) -> Result<Option<Order>> {
    query_one(
        conn,
        "SELECT * FROM orders WHERE external_order_ref = ? AND flowfix_status = ? LIMIT 1",
        &[&external_order_ref as &dyn ToSql, &FlowfixStatus::ShippingInProgress],
    )
}

/// Orders stuck in `shipping_in_progress` since strictly before `cutoff`
pub fn list_stale_in_progress(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
    query_orders(
        conn,
        r#"
        SELECT * FROM orders
        WHERE flowfix_status = ? AND shipping_started_at < ?
        ORDER BY shipping_started_at ASC
        "#,
        &[&FlowfixStatus::ShippingInProgress as &dyn ToSql, &to_millis(cutoff)],
    )
}

/// A shop's orders created at or after `since`, oldest first
pub fn list_shop_orders_since(
    conn: &Connection,
    shop_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Order>> {
    query_orders(
        conn,
        "SELECT * FROM orders WHERE shop_id = ? AND created_at >= ? ORDER BY created_at ASC",
        &[&shop_id as &dyn ToSql, &to_millis(since)],
    )
}

/// Count orders whose last sync failed and were touched after `since`
pub fn count_sync_failures_since(conn: &Connection, since: DateTime<Utc>) -> Result<u64> {
    let placeholders: Vec<_> = sync_status::FAILURES.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT COUNT(*) FROM orders WHERE last_sync_status IN ({}) AND updated_at > ?",
        placeholders.join(", ")
    );

    let since = to_millis(since);
    let mut params: Vec<&dyn ToSql> = sync_status::FAILURES
        .iter()
        .map(|s| s as &dyn ToSql)
        .collect();
    params.push(&since);

    let count: i64 = conn.query_row(&sql, params.as_slice(), |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Notes for an order, in arrival order
pub fn get_notes(conn: &Connection, order_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT note FROM order_notes WHERE order_id = ? ORDER BY position ASC")?;
    let notes = stmt
        .query_map(params![order_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(notes)
}

/// Append notes not already present. Existing notes are never touched.
/// Returns the number of notes appended.
pub fn append_notes(conn: &Connection, order_id: &str, notes: &[String]) -> Result<usize> {
    let mut existing = get_notes(conn, order_id)?;
    let mut position = existing.len() as i64;
    let mut appended = 0;

    for note in notes {
        if existing.contains(note) {
            continue;
        }
        conn.execute(
            "INSERT INTO order_notes (order_id, position, note) VALUES (?, ?, ?)",
            params![order_id, position, note],
        )?;
        existing.push(note.clone());
        position += 1;
        appended += 1;
    }

    Ok(appended)
}

// ============================================================================
// Conditional transitions
// ============================================================================

/// Timestamp stamped by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    None,
    /// Entry into `shipping_in_progress`
    ShippingStarted,
    /// Entry into `shipped` from an external confirmation
    FulfillmentConfirmed,
}

/// Extra precondition on `shipping_started_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartGuard {
    Any,
    /// Started strictly before the instant (deadline breach)
    StartedBefore(DateTime<Utc>),
    /// Still the same in-flight request
    StartedAt(DateTime<Utc>),
}

/// A status write conditioned on the status the writer last observed
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub order_id: &'a str,
    pub from: FlowfixStatus,
    pub to: FlowfixStatus,
    pub sync_status: &'a str,
    pub sync_detail: Option<&'a str>,
    pub retry_after_secs: Option<u64>,
    pub stamp: Stamp,
    pub guard: StartGuard,
    pub at: DateTime<Utc>,
}

impl<'a> Transition<'a> {
    pub fn new(
        order_id: &'a str,
        from: FlowfixStatus,
        to: FlowfixStatus,
        sync_status: &'a str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            from,
            to,
            sync_status,
            sync_detail: None,
            retry_after_secs: None,
            stamp: Stamp::None,
            guard: StartGuard::Any,
            at,
        }
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.sync_detail = Some(detail);
        self
    }

    pub fn retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = stamp;
        self
    }

    pub fn guard(mut self, guard: StartGuard) -> Self {
        self.guard = guard;
        self
    }
}

/// Apply a transition if its preconditions still hold.
///
/// Returns true when the row was updated, false when another writer changed
/// the order first (or it does not exist).
pub fn apply_transition(conn: &Connection, t: &Transition<'_>) -> Result<bool> {
    let at = to_millis(t.at);
    let retry_after = t.retry_after_secs.map(|s| s as i64);
    let guard_ms = match t.guard {
        StartGuard::Any => None,
        StartGuard::StartedBefore(instant) | StartGuard::StartedAt(instant) => Some(to_millis(instant)),
    };

    let mut sql = String::from(
        "UPDATE orders SET flowfix_status = ?, last_sync_status = ?, sync_detail = ?, \
         retry_after_secs = ?, updated_at = ?",
    );
    let mut params: Vec<&dyn ToSql> = vec![&t.to, &t.sync_status, &t.sync_detail, &retry_after, &at];

    match t.stamp {
        Stamp::None => {}
        Stamp::ShippingStarted => {
            sql.push_str(", shipping_started_at = ?");
            params.push(&at);
        }
        Stamp::FulfillmentConfirmed => {
            sql.push_str(", fulfillment_confirmed_at = ?");
            params.push(&at);
        }
    }

    sql.push_str(" WHERE id = ? AND flowfix_status = ?");
    params.push(&t.order_id);
    params.push(&t.from);

    if let Some(ms) = guard_ms.as_ref() {
        match t.guard {
            StartGuard::StartedBefore(_) => sql.push_str(" AND shipping_started_at < ?"),
            _ => sql.push_str(" AND shipping_started_at = ?"),
        }
        params.push(ms);
    }

    let changes = conn.execute(&sql, params.as_slice())?;
    debug!(
        order_id = t.order_id,
        from = %t.from,
        to = %t.to,
        applied = changes == 1,
        "Order transition"
    );
    Ok(changes == 1)
}
