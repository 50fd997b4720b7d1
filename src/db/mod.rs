//! SQLite entity store for shops, orders and interventions
//!
//! ## Tables
//!
//! - `shops` - connected stores and their trust fields
//! - `orders` - order status and diagnostics for two-phase fulfillment
//! - `order_notes` - append-only customer notes per order
//! - `interventions` - append-only trust-reset ledger
//!
//! All status-changing writes are conditional on the status the writer last
//! read; see [`orders::apply_transition`].

pub mod interventions;
pub mod models;
pub mod orders;
pub mod schema;
pub mod shops;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, TrustFulfillError};

/// Database file name inside the data directory
pub const DB_FILE_NAME: &str = "trustfulfill.db";

/// SQLite-backed entity store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;

        // WAL mode
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init(conn)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read-only operation against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrustFulfillError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a write operation with exclusive access (transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| TrustFulfillError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Row counts for the status endpoint and CLI
    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
                Ok(n as u64)
            };

            Ok(StoreStats {
                shop_count: count("shops")?,
                order_count: count("orders")?,
                intervention_count: count("interventions")?,
            })
        })
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub shop_count: u64,
    pub order_count: u64,
    pub intervention_count: u64,
}

pub use models::{FlowfixStatus, Intervention, Order, Shop};
