//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(SHOPS_SCHEMA)?;
    conn.execute_batch(ORDERS_SCHEMA)?;
    conn.execute_batch(INTERVENTIONS_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

const SHOPS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shops (
    id TEXT PRIMARY KEY NOT NULL,
    external_store_ref TEXT NOT NULL UNIQUE,
    domestic_countries_json TEXT NOT NULL DEFAULT '["US","CA","PR"]',

    -- Trust fields, written only by the trust ledger
    last_intervention_at INTEGER,
    last_intervention_reason TEXT,
    current_trust_streak_hours REAL NOT NULL DEFAULT 0 CHECK (current_trust_streak_hours >= 0),
    total_interventions INTEGER NOT NULL DEFAULT 0 CHECK (total_interventions >= 0),

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const ORDERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY NOT NULL,
    shop_id TEXT NOT NULL,
    external_order_ref TEXT NOT NULL,
    order_number TEXT NOT NULL,

    -- Two-phase fulfillment
    flowfix_status TEXT NOT NULL DEFAULT 'awaiting_action' CHECK (flowfix_status IN
        ('awaiting_action', 'shipping_in_progress', 'shipped', 'needs_verification')),
    shipping_started_at INTEGER,
    fulfillment_confirmed_at INTEGER,
    last_sync_status TEXT NOT NULL,
    sync_detail TEXT,
    retry_after_secs INTEGER,

    -- Customer data
    customer_name TEXT NOT NULL DEFAULT '',
    customer_email TEXT NOT NULL DEFAULT '',
    address_display TEXT NOT NULL,
    is_domestic INTEGER NOT NULL,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    UNIQUE (shop_id, external_order_ref)
);

-- Notes are append-only; position preserves arrival order
CREATE TABLE IF NOT EXISTS order_notes (
    order_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    note TEXT NOT NULL,
    PRIMARY KEY (order_id, position)
);
"#;

const INTERVENTIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS interventions (
    id TEXT PRIMARY KEY NOT NULL,
    shop_id TEXT NOT NULL,
    order_id TEXT NOT NULL,
    order_number TEXT NOT NULL,
    reason TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    previous_streak REAL NOT NULL CHECK (previous_streak >= 0),
    details_json TEXT,
    event_key TEXT NOT NULL UNIQUE
);

-- Interventions are an append-only ledger
CREATE TRIGGER IF NOT EXISTS interventions_no_update
BEFORE UPDATE ON interventions
BEGIN
    SELECT RAISE(ABORT, 'interventions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS interventions_no_delete
BEFORE DELETE ON interventions
BEGIN
    SELECT RAISE(ABORT, 'interventions are append-only');
END;
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_status_started
    ON orders (flowfix_status, shipping_started_at);
CREATE INDEX IF NOT EXISTS idx_orders_shop_created
    ON orders (shop_id, created_at);
CREATE INDEX IF NOT EXISTS idx_orders_sync_updated
    ON orders (last_sync_status, updated_at);

-- One in-flight fulfillment per external order reference
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_single_in_flight
    ON orders (external_order_ref)
    WHERE flowfix_status = 'shipping_in_progress';

CREATE INDEX IF NOT EXISTS idx_interventions_shop_time
    ON interventions (shop_id, timestamp);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' \
                 AND name IN ('shops', 'orders', 'order_notes', 'interventions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
