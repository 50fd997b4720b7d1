//! trustfulfill: two-phase order fulfillment with trust-streak tracking
//!
//! An order's fulfillment is requested from the store platform and then
//! resolved either by a confirmation webhook (fast path) or by the timeout
//! reconciler once the confirmation deadline passes (slow path). Every slow
//! path resolution is recorded as an intervention and resets the owning
//! shop's trust streak: the time the shop has run without operator help.
//!
//! ## Modules
//!
//! - [`db`] - SQLite entity store (shops, orders, interventions)
//! - [`fulfillment`] - order state machine and the store platform gateway
//! - [`reconciler`] - periodic timeout detection
//! - [`webhook`] - signed confirmation intake
//! - [`trust`] - intervention write path and streak recomputation
//! - [`monitor`] - intervention pattern alerts
//! - [`sync`] - periodic pull of today's orders from the store platform
//! - [`dashboard`], [`ingest`], [`api`] - read path, order intake, HTTP glue

pub mod api;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod fulfillment;
pub mod ingest;
pub mod monitor;
pub mod reconciler;
pub mod sync;
pub mod tasks;
pub mod trust;
pub mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{FlowfixStatus, Intervention, Order, Shop, Store};
pub use error::{Result, TrustFulfillError};
