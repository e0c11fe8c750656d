//! mou-rest - REST server core for MoU statement-of-work tables
//!
//! Each MoU owns a set of numbered collections of task records; an alias
//! marks which one is live. Clients read the live collection, submit edit
//! batches checked against per-row markers, and admins bulk-load
//! spreadsheets or raw dumps as a new live collection.
//!
//! ## Components
//!
//! - **Store**: collections, the live alias and atomic batches (MongoDB or memory)
//! - **Migrate**: legacy dumps brought up to the current record shape
//! - **Ingest**: xlsx and dump bulk loads
//! - **Auth**: bearer tokens, roles and institution-scoped write access
//! - **Reconcile**: optimistic-concurrency edit sessions
//! - **Table**: per-MoU table layout and computed total rows

pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod reconcile;
pub mod routes;
pub mod server;
pub mod store;
pub mod table;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{MouError, Result};
