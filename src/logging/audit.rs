//! Audit logging for MoU mutations
//!
//! Appends one JSON object per line for every applied or rejected edit
//! batch, ingestion, snapshot and alias swap. Without a configured file the
//! logger is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::Role;
use crate::types::RowId;

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Reconciliation batch committed
    BatchApplied,
    /// Reconciliation batch refused
    BatchRejected,
    /// Spreadsheet or dump bulk-loaded
    Ingestion,
    /// Live collection copied into a snapshot
    Snapshot,
    /// Live alias moved to another collection
    AliasSwap,
    /// Institution values confirmed by a PI
    Confirmation,
    /// MoU-wide confirmation touchstone moved
    Touchstone,
}

/// One audit line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub mou: String,
    /// Acting subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Edit session the event belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_ids: Vec<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: EventType, mou: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            mou: mou.to_string(),
            actor: None,
            role: None,
            session_id: None,
            collection: None,
            previous_collection: None,
            row_ids: Vec::new(),
            records: None,
            reason: None,
            metadata: None,
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn with_role(mut self, role: Option<Role>) -> Self {
        self.role = role;
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the target collection and the one it replaced
    pub fn with_collection(mut self, collection: &str, previous: Option<&str>) -> Self {
        self.collection = Some(collection.to_string());
        self.previous_collection = previous.map(str::to_string);
        self
    }

    pub fn with_rows(mut self, row_ids: Vec<RowId>) -> Self {
        self.row_ids = row_ids;
        self
    }

    pub fn with_records(mut self, records: u64) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger that writes events to a JSONL file
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditLoggerInner>>,
}

struct AuditLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuditLoggerInner {
                writer: None,
                path: None,
            })),
        }
    }

    /// Initialize file logging to the specified path
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().await;
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Audit logging initialized to {}", path.display());
        Ok(())
    }

    /// File being written, if any
    pub async fn path(&self) -> Option<PathBuf> {
        self.inner.lock().await.path.clone()
    }

    /// Log an audit event
    pub async fn log(&self, event: AuditEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write audit event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    pub async fn log_batch_applied(
        &self,
        mou: &str,
        actor: &str,
        role: Option<Role>,
        session_id: Uuid,
        row_ids: Vec<RowId>,
    ) {
        let event = AuditEvent::new(EventType::BatchApplied, mou)
            .with_actor(actor)
            .with_role(role)
            .with_session(session_id)
            .with_records(row_ids.len() as u64)
            .with_rows(row_ids);
        self.log(event).await;
    }

    pub async fn log_batch_rejected(
        &self,
        mou: &str,
        actor: &str,
        role: Option<Role>,
        session_id: Uuid,
        reason: &str,
        row_ids: Vec<RowId>,
    ) {
        let event = AuditEvent::new(EventType::BatchRejected, mou)
            .with_actor(actor)
            .with_role(role)
            .with_session(session_id)
            .with_reason(reason)
            .with_rows(row_ids);
        self.log(event).await;
    }

    pub async fn log_ingestion(
        &self,
        mou: &str,
        actor: &str,
        collection: &str,
        previous: Option<&str>,
        records: u64,
        rejected: usize,
    ) {
        let mut event = AuditEvent::new(EventType::Ingestion, mou)
            .with_actor(actor)
            .with_collection(collection, previous)
            .with_records(records);
        event.metadata = Some(serde_json::json!({ "rejected_rows": rejected }));
        self.log(event).await;
    }

    pub async fn log_snapshot(&self, mou: &str, actor: &str, collection: &str, label: &str) {
        let event = AuditEvent::new(EventType::Snapshot, mou)
            .with_actor(actor)
            .with_collection(collection, None)
            .with_reason(label);
        self.log(event).await;
    }

    pub async fn log_alias_swap(&self, mou: &str, actor: &str, to: &str, from: Option<&str>) {
        let event = AuditEvent::new(EventType::AliasSwap, mou)
            .with_actor(actor)
            .with_collection(to, from);
        self.log(event).await;
    }

    pub async fn log_confirmation(&self, mou: &str, actor: &str, institution: &str, parts: serde_json::Value) {
        let mut event = AuditEvent::new(EventType::Confirmation, mou)
            .with_actor(actor)
            .with_reason(institution);
        event.metadata = Some(parts);
        self.log(event).await;
    }

    pub async fn log_touchstone(&self, mou: &str, actor: &str, at: DateTime<Utc>) {
        let event = AuditEvent::new(EventType::Touchstone, mou)
            .with_actor(actor)
            .with_reason(at.to_rfc3339());
        self.log(event).await;
    }
}
