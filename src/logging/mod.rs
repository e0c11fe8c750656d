//! Logging infrastructure for the MoU server
//!
//! Structured `tracing` output is configured in `main`; this module holds
//! the append-only audit trail of record mutations.

pub mod audit;

pub use audit::{AuditEvent, AuditLogger, EventType};
