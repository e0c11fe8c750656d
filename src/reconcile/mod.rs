//! Table Reconciliation Engine
//!
//! Accepts a client edit set built against markers observed at read time,
//! checks it, and commits it as one transaction.
//!
//! Session states: `Proposed -> Validated -> Applied | Rejected`. A batch is
//! rejected as a whole on the first failing check, in this order:
//!
//! 0. institutions: every inserted or updated row names a directory entry,
//!    stored under its short name
//! 1. scope: every touched institution must be writable (for updates both
//!    the current and the new one); purge needs write-all
//! 2. validity: row bodies, WBS values, duplicate row ids, deleted-state
//!    transitions
//! 3. conflicts: base markers must match the live rows; inserts must use a
//!    fresh row id. Every conflicting row is named.
//!
//! The store re-checks markers inside its per-MoU critical section, so a
//! concurrent commit between the checks still surfaces as a conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, MutationScope};
use crate::directory::{DirectoryError, InstitutionDirectory};
use crate::logging::AuditLogger;
use crate::store::{RecordStore, TxOp};
use crate::types::{
    wbs_tree, InstitutionEdit, Marker, MouError, RecordBody, RecordKind, Result, RowId, TaskRecord,
    ValueParts, WbsTree,
};

/// One client edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    /// New row; a row id is generated when none is given
    Insert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_id: Option<RowId>,
        record: RecordBody,
    },
    Update {
        row_id: RowId,
        base_marker: Marker,
        record: RecordBody,
    },
    Delete {
        row_id: RowId,
        base_marker: Marker,
    },
    Restore {
        row_id: RowId,
        base_marker: Marker,
    },
    /// Physical removal, write-all only
    Purge {
        row_id: RowId,
        base_marker: Marker,
    },
}

impl EditOp {
    pub fn row_id(&self) -> Option<&RowId> {
        match self {
            Self::Insert { row_id, .. } => row_id.as_ref(),
            Self::Update { row_id, .. }
            | Self::Delete { row_id, .. }
            | Self::Restore { row_id, .. }
            | Self::Purge { row_id, .. } => Some(row_id),
        }
    }

    fn record_mut(&mut self) -> Option<&mut RecordBody> {
        match self {
            Self::Insert { record, .. } | Self::Update { record, .. } => Some(record),
            _ => None,
        }
    }

    fn base_marker(&self) -> Option<&Marker> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { base_marker, .. }
            | Self::Delete { base_marker, .. }
            | Self::Restore { base_marker, .. }
            | Self::Purge { base_marker, .. } => Some(base_marker),
        }
    }
}

/// Lifecycle of an edit session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Proposed,
    Validated,
    Applied,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Rejected)
    }

    fn can_become(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Validated)
                | (Self::Proposed, Self::Rejected)
                | (Self::Validated, Self::Applied)
                | (Self::Validated, Self::Rejected)
        )
    }
}

/// One submitted batch and where it is in its lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct EditSession {
    pub id: Uuid,
    pub mou: String,
    pub actor: String,
    pub state: SessionState,
    pub ops: Vec<EditOp>,
}

impl EditSession {
    pub fn propose(mou: &str, identity: &Identity, ops: Vec<EditOp>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mou: mou.to_string(),
            actor: identity.subject.clone(),
            state: SessionState::Proposed,
            ops,
        }
    }

    fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(MouError::Internal(format!(
                "edit session {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "Edit session transition");
        self.state = next;
        Ok(())
    }
}

/// Result of an applied batch
#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub session_id: Uuid,
    pub state: SessionState,
    pub applied: usize,
    /// Rows as committed; purged rows are absent
    pub records: Vec<TaskRecord>,
    pub purged: Vec<RowId>,
}

/// Checks and commits edit batches
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn InstitutionDirectory>,
    audit: AuditLogger,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn InstitutionDirectory>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            directory,
            audit,
        }
    }

    /// Check and apply a batch for `identity` holding `scope`
    pub async fn submit(
        &self,
        mou: &str,
        identity: &Identity,
        scope: &MutationScope,
        ops: Vec<EditOp>,
    ) -> Result<EditOutcome> {
        let mut session = EditSession::propose(mou, identity, ops);
        info!(
            session = %session.id,
            mou = %mou,
            actor = %session.actor,
            ops = session.ops.len(),
            "Edit batch proposed"
        );

        if let Err(err) = self.resolve_institutions(&mut session.ops).await {
            return Err(self.reject(&mut session, identity, err).await);
        }

        let live: HashMap<RowId, TaskRecord> = self
            .store
            .get_live(mou)
            .await?
            .into_iter()
            .map(|r| (r.row_id.clone(), r))
            .collect();

        let tx_ops = match plan(&session, &live, scope) {
            Ok(tx_ops) => tx_ops,
            Err(err) => return Err(self.reject(&mut session, identity, err).await),
        };
        session.advance(SessionState::Validated)?;

        let edits = institution_edits(&tx_ops, &live, Utc::now());
        if let Err(err) = self.store.apply_batch(mou, tx_ops.clone(), &edits).await {
            return Err(self.reject(&mut session, identity, err).await);
        }
        session.advance(SessionState::Applied)?;

        let mut records = Vec::new();
        let mut purged = Vec::new();
        for op in &tx_ops {
            match committed_row(op, &live) {
                Some(record) => records.push(record),
                None => purged.push(op.row_id().clone()),
            }
        }
        let touched: Vec<RowId> = tx_ops.iter().map(|op| op.row_id().clone()).collect();

        self.audit
            .log_batch_applied(mou, &session.actor, identity.role, session.id, touched)
            .await;
        info!(session = %session.id, mou = %mou, applied = tx_ops.len(), "Edit batch applied");

        Ok(EditOutcome {
            session_id: session.id,
            state: session.state,
            applied: tx_ops.len(),
            records,
            purged,
        })
    }

    /// Replace each row's institution with its directory short name
    async fn resolve_institutions(&self, ops: &mut [EditOp]) -> Result<()> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        for op in ops.iter_mut() {
            let Some(record) = op.record_mut() else {
                continue;
            };
            if record.institution.trim().is_empty() {
                continue;
            }
            if let Some(short_name) = resolved.get(&record.institution) {
                record.institution = short_name.clone();
                continue;
            }
            let short_name = match self.directory.resolve(&record.institution).await {
                Ok(inst) => inst.short_name,
                Err(DirectoryError::NotFound(name)) => {
                    return Err(MouError::Validation(format!("unknown institution '{}'", name)))
                }
                Err(e) => return Err(e.into()),
            };
            resolved.insert(record.institution.clone(), short_name.clone());
            record.institution = short_name;
        }
        Ok(())
    }

    async fn reject(&self, session: &mut EditSession, identity: &Identity, err: MouError) -> MouError {
        if let Err(e) = session.advance(SessionState::Rejected) {
            return e;
        }
        let row_ids = match &err {
            MouError::Conflict(ids) => ids.clone(),
            _ => Vec::new(),
        };
        warn!(
            session = %session.id,
            mou = %session.mou,
            actor = %session.actor,
            error = %err,
            "Edit batch rejected"
        );
        self.audit
            .log_batch_rejected(
                &session.mou,
                &session.actor,
                identity.role,
                session.id,
                err.code(),
                row_ids,
            )
            .await;
        err
    }
}

/// Check a proposed session and turn it into store operations
fn plan(
    session: &EditSession,
    live: &HashMap<RowId, TaskRecord>,
    scope: &MutationScope,
) -> Result<Vec<TxOp>> {
    if session.ops.is_empty() {
        return Err(MouError::Validation("edit batch is empty".into()));
    }

    check_scope(&session.ops, live, scope)?;
    check_validity(&session.ops, live, wbs_tree(&session.mou))?;

    let conflicts: Vec<RowId> = session
        .ops
        .iter()
        .filter_map(|op| {
            let row_id = op.row_id()?;
            let current = live.get(row_id);
            let stale = match op.base_marker() {
                None => current.is_some(),
                Some(base) => current.map_or(true, |row| &row.marker != base),
            };
            stale.then(|| row_id.clone())
        })
        .collect();
    if !conflicts.is_empty() {
        return Err(MouError::Conflict(conflicts));
    }

    let now = Utc::now();
    let actor = session.actor.as_str();
    session
        .ops
        .iter()
        .map(|op| -> Result<TxOp> {
            Ok(match op {
                EditOp::Insert { row_id, record } => TxOp::Insert(TaskRecord::new(
                    row_id.clone().unwrap_or_else(RowId::generate),
                    record.clone(),
                    Marker::origin().next(actor, now)?,
                )),
                EditOp::Update {
                    row_id,
                    base_marker,
                    record,
                } => TxOp::Update {
                    record: TaskRecord::new(
                        row_id.clone(),
                        record.clone(),
                        base_marker.next(actor, now)?,
                    ),
                    expected: base_marker.clone(),
                },
                EditOp::Delete {
                    row_id,
                    base_marker,
                } => TxOp::Delete {
                    row_id: row_id.clone(),
                    expected: base_marker.clone(),
                    marker: base_marker.next(actor, now)?,
                },
                EditOp::Restore {
                    row_id,
                    base_marker,
                } => TxOp::Restore {
                    row_id: row_id.clone(),
                    expected: base_marker.clone(),
                    marker: base_marker.next(actor, now)?,
                },
                EditOp::Purge {
                    row_id,
                    base_marker,
                } => TxOp::Purge {
                    row_id: row_id.clone(),
                    expected: base_marker.clone(),
                },
            })
        })
        .collect()
}

fn check_scope(
    ops: &[EditOp],
    live: &HashMap<RowId, TaskRecord>,
    scope: &MutationScope,
) -> Result<()> {
    let writable = |institution: &str| -> Result<()> {
        if scope.permits_write(institution) {
            Ok(())
        } else {
            Err(MouError::Unauthorized(format!(
                "no write access to institution '{}'",
                institution
            )))
        }
    };

    if matches!(scope, MutationScope::NoAccess | MutationScope::ReadOnly) {
        return Err(MouError::Unauthorized("read-only access".into()));
    }
    for op in ops {
        if matches!(op, EditOp::Purge { .. }) && !scope.is_write_all() {
            return Err(MouError::Unauthorized("purge requires admin".into()));
        }
        if let Some(current) = op.row_id().and_then(|id| live.get(id)) {
            writable(current.institution())?;
        }
        if let EditOp::Insert { record, .. } | EditOp::Update { record, .. } = op {
            writable(&record.institution)?;
        }
    }
    Ok(())
}

fn check_validity(
    ops: &[EditOp],
    live: &HashMap<RowId, TaskRecord>,
    wbs: Option<&WbsTree>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for op in ops {
        if let Some(row_id) = op.row_id() {
            if row_id.as_str().is_empty() {
                return Err(MouError::Validation("empty row id".into()));
            }
            if !seen.insert(row_id) {
                return Err(MouError::Validation(format!(
                    "row '{}' appears more than once in the batch",
                    row_id
                )));
            }
        }

        let current = op.row_id().and_then(|id| live.get(id));
        match op {
            EditOp::Insert { record, .. } | EditOp::Update { record, .. } => {
                let checked = record
                    .validate()
                    .and_then(|()| wbs.map_or(Ok(()), |tree| tree.check(record)));
                checked.map_err(|reason| {
                    MouError::Validation(match op.row_id() {
                        Some(id) => format!("row '{}': {}", id, reason),
                        None => format!("new row: {}", reason),
                    })
                })?;
            }
            _ => {}
        }
        // Markers are checked later; only a matching row can be judged here
        let Some(current) = current.filter(|row| Some(&row.marker) == op.base_marker()) else {
            continue;
        };
        let problem = match op {
            EditOp::Update { .. } if current.deleted => Some("is deleted; restore it first"),
            EditOp::Delete { .. } if current.deleted => Some("is already deleted"),
            EditOp::Restore { .. } if !current.deleted => Some("is not deleted"),
            _ => None,
        };
        if let Some(problem) = problem {
            return Err(MouError::Validation(format!(
                "row '{}' {}",
                current.row_id, problem
            )));
        }
    }
    Ok(())
}

/// Institution values a batch touches, one entry per institution
fn institution_edits(
    ops: &[TxOp],
    live: &HashMap<RowId, TaskRecord>,
    at: DateTime<Utc>,
) -> Vec<InstitutionEdit> {
    let mut touched: BTreeMap<String, ValueParts> = BTreeMap::new();
    let mut note = |institution: &str, parts: ValueParts| {
        if parts.any() {
            let entry = touched.entry(institution.to_string()).or_default();
            *entry = entry.union(parts);
        }
    };

    for op in ops {
        let current = live.get(op.row_id()).map(|row| &row.body);
        match op {
            TxOp::Insert(record) | TxOp::Update { record, .. } => {
                note(&record.body.institution, changed_parts(current, Some(&record.body)));
                if let Some(before) = current.filter(|b| b.institution != record.body.institution) {
                    note(&before.institution, changed_parts(Some(before), None));
                }
            }
            TxOp::Delete { .. } | TxOp::Restore { .. } | TxOp::Purge { .. } => {
                if let Some(row) = current {
                    note(&row.institution, changed_parts(Some(row), None));
                }
            }
        }
    }

    touched
        .into_iter()
        .map(|(institution, parts)| InstitutionEdit {
            institution,
            parts,
            at,
        })
        .collect()
}

/// Parts that differ between two states of a row
fn changed_parts(before: Option<&RecordBody>, after: Option<&RecordBody>) -> ValueParts {
    let is_task = |body: Option<&RecordBody>| body.is_some_and(|b| b.kind == RecordKind::Task);
    let headcounts = |body: Option<&RecordBody>| body.map(|b| b.headcounts.clone()).unwrap_or_default();
    let computing = |body: Option<&RecordBody>| body.map(|b| b.computing.clone()).unwrap_or_default();
    ValueParts {
        table: is_task(before) || is_task(after),
        headcounts: headcounts(before) != headcounts(after),
        computing: computing(before) != computing(after),
    }
}

/// Row state after `op` commits, `None` when purged
fn committed_row(op: &TxOp, live: &HashMap<RowId, TaskRecord>) -> Option<TaskRecord> {
    match op {
        TxOp::Insert(record) | TxOp::Update { record, .. } => Some(record.clone()),
        TxOp::Delete { row_id, marker, .. } | TxOp::Restore { row_id, marker, .. } => {
            live.get(row_id).map(|row| {
                let mut row = row.clone();
                row.deleted = matches!(op, TxOp::Delete { .. });
                row.marker = marker.clone();
                row
            })
        }
        TxOp::Purge { .. } => None,
    }
}
