//! Record Store
//!
//! Durable table abstraction over task records, keyed by MoU and resolved
//! through the `LIVE_COLLECTION` alias. Numbered collections are immutable
//! once written except for the live one, which only changes through
//! [`RecordStore::apply_transaction`].
//!
//! ## Write exclusivity
//!
//! Every write path (transactions, alias swaps, bulk loads) takes the
//! per-MoU lock in [`MouLocks`] once and holds it for the whole operation,
//! collection naming included. Backends implement the unlocked
//! `commit_ops` / `swap_alias` / `write_collection` primitives; the locked
//! operations are provided here once for both backends.

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::types::{
    snapshot_name, CollectionInfo, ConfirmationState, InstitutionEdit, Marker, MouError, Result,
    RowId, TaskRecord,
};

/// One operation of an atomic batch, with its precondition
#[derive(Debug, Clone)]
pub enum TxOp {
    /// Add a row; the row id must not exist yet
    Insert(TaskRecord),
    /// Replace a row whose current marker equals `expected`
    Update { record: TaskRecord, expected: Marker },
    /// Logically delete a row
    Delete {
        row_id: RowId,
        expected: Marker,
        marker: Marker,
    },
    /// Undo a logical delete
    Restore {
        row_id: RowId,
        expected: Marker,
        marker: Marker,
    },
    /// Physically remove a row
    Purge { row_id: RowId, expected: Marker },
}

impl TxOp {
    pub fn row_id(&self) -> &RowId {
        match self {
            Self::Insert(record) => &record.row_id,
            Self::Update { record, .. } => &record.row_id,
            Self::Delete { row_id, .. } | Self::Restore { row_id, .. } | Self::Purge { row_id, .. } => {
                row_id
            }
        }
    }

    /// Marker the row must currently carry, `None` for inserts
    pub fn expected(&self) -> Option<&Marker> {
        match self {
            Self::Insert(_) => None,
            Self::Update { expected, .. }
            | Self::Delete { expected, .. }
            | Self::Restore { expected, .. }
            | Self::Purge { expected, .. } => Some(expected),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Restore { .. } => "restore",
            Self::Purge { .. } => "purge",
        }
    }

    /// Check the precondition against the row's current state
    pub fn precondition_holds(&self, current: Option<&TaskRecord>) -> bool {
        match (self.expected(), current) {
            (None, None) => true,
            (Some(expected), Some(row)) => &row.marker == expected,
            _ => false,
        }
    }
}

/// Per-MoU write locks shared by every write path
#[derive(Default)]
pub struct MouLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MouLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to a MoU
    pub async fn lock(&self, mou: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.locks.entry(mou.to_string()).or_default());
        lock.lock_owned().await
    }
}

/// Storage backend for MoU collections
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All rows of the live collection ordered by row id, deleted rows included
    ///
    /// A MoU without a live collection reads as empty.
    async fn get_live(&self, mou: &str) -> Result<Vec<TaskRecord>>;

    /// All rows of a named collection ordered by row id
    async fn get_collection(&self, mou: &str, name: &str) -> Result<Vec<TaskRecord>>;

    /// Name the live alias currently resolves to
    async fn live_collection_name(&self, mou: &str) -> Result<Option<String>>;

    /// Metadata of every stored collection, oldest first
    async fn list_collections(&self, mou: &str) -> Result<Vec<CollectionInfo>>;

    /// Lock table used by the provided write operations
    fn locks(&self) -> &MouLocks;

    /// Check preconditions and apply `ops` to the live collection atomically
    ///
    /// Callers must hold the MoU write lock.
    async fn commit_ops(&self, mou: &str, ops: &[TxOp]) -> Result<()>;

    /// Point the live alias at `collection`, returning the previous target
    ///
    /// Callers must hold the MoU write lock.
    async fn swap_alias(
        &self,
        mou: &str,
        collection: &str,
        require_non_empty: bool,
    ) -> Result<Option<String>>;

    /// Store a new numbered collection without touching the alias
    ///
    /// Callers must hold the MoU write lock.
    async fn write_collection(
        &self,
        mou: &str,
        info: CollectionInfo,
        records: Vec<TaskRecord>,
    ) -> Result<()>;

    /// Institution confirmation state, default when never saved
    async fn load_confirmations(&self, mou: &str) -> Result<ConfirmationState>;

    /// Persist institution confirmation state
    ///
    /// Callers must hold the MoU write lock.
    async fn save_confirmations(&self, mou: &str, state: &ConfirmationState) -> Result<()>;

    /// Apply a batch as a single all-or-nothing unit
    ///
    /// A failed precondition rejects the whole batch with
    /// [`MouError::Conflict`] naming every offending row.
    async fn apply_transaction(&self, mou: &str, ops: Vec<TxOp>) -> Result<()> {
        self.apply_batch(mou, ops, &[]).await
    }

    /// Apply a batch and stamp the institution values it edited
    ///
    /// The edit stamps are written after the commit under the same lock. A
    /// failure to write them is logged; the committed batch stands.
    async fn apply_batch(&self, mou: &str, ops: Vec<TxOp>, edits: &[InstitutionEdit]) -> Result<()> {
        let _guard = self.locks().lock(mou).await;
        self.commit_ops(mou, &ops).await?;
        info!(mou = %mou, ops = ops.len(), "Transaction committed");

        if edits.is_empty() {
            return Ok(());
        }
        let stamped = async {
            let mut state = self.load_confirmations(mou).await?;
            for edit in edits {
                state.note_edit(edit);
            }
            self.save_confirmations(mou, &state).await
        };
        if let Err(e) = stamped.await {
            warn!(mou = %mou, error = %e, "Failed to record institution edit times");
        }
        Ok(())
    }

    /// Change the confirmation state under the MoU write lock
    async fn update_confirmations(
        &self,
        mou: &str,
        change: &(dyn for<'c> Fn(&'c mut ConfirmationState) + Send + Sync),
    ) -> Result<ConfirmationState> {
        let _guard = self.locks().lock(mou).await;
        let mut state = self.load_confirmations(mou).await?;
        change(&mut state);
        self.save_confirmations(mou, &state).await?;
        Ok(state)
    }

    /// Atomically promote `collection` to live
    ///
    /// Fails with [`MouError::StoreUnavailable`] when the collection is
    /// missing, or empty while `require_non_empty` is set; the alias is left
    /// untouched in that case.
    async fn replace_live(
        &self,
        mou: &str,
        collection: &str,
        require_non_empty: bool,
    ) -> Result<Option<String>> {
        let _guard = self.locks().lock(mou).await;
        let previous = self.swap_alias(mou, collection, require_non_empty).await?;
        info!(mou = %mou, from = ?previous, to = %collection, "Live alias swapped");
        Ok(previous)
    }

    /// Write `records` as a new collection and promote it to live
    ///
    /// Establishes a new baseline, so no conflict detection applies. The
    /// previous live collection stays as a historical snapshot. A taken
    /// collection name moves `info` forward to the next free millisecond.
    async fn bulk_load(
        &self,
        mou: &str,
        info: CollectionInfo,
        records: Vec<TaskRecord>,
    ) -> Result<Option<String>> {
        let _guard = self.locks().lock(mou).await;
        let info = claim_name(info, &self.collection_names(mou).await?);
        let name = info.name.clone();
        let count = records.len();
        self.write_collection(mou, info, records).await?;
        let previous = self.swap_alias(mou, &name, count > 0).await?;
        info!(mou = %mou, collection = %name, records = count, previous = ?previous, "Bulk load promoted");
        Ok(previous)
    }

    /// Replace the live collection with rows derived from it, in one locked unit
    ///
    /// `prepare` receives the current live rows and returns the rows to
    /// promote. No other write to the MoU can land between that read, the
    /// optional "before" snapshot of those rows, the history imports and the
    /// alias swap.
    async fn replace_from_live(
        &self,
        mou: &str,
        load: BulkLoad,
        prepare: &(dyn for<'r> Fn(&'r [TaskRecord]) -> Result<Vec<TaskRecord>> + Send + Sync),
    ) -> Result<BulkOutcome> {
        let _guard = self.locks().lock(mou).await;

        let previous_rows = self.get_live(mou).await?;
        let records = prepare(&previous_rows)?;
        if records.is_empty() {
            return Err(MouError::Validation("bulk load has no records".into()));
        }

        let mut taken = self.collection_names(mou).await?;
        let mut imported_history = Vec::new();
        for (info, rows) in load.history {
            if taken.insert(info.name.clone()) {
                imported_history.push(info.name.clone());
                self.write_collection(mou, info, rows).await?;
            }
        }

        let now = Utc::now();
        let before = match load.before_label {
            Some(ref label) if !previous_rows.is_empty() => {
                let creator = format!("{} (auto)", load.creator);
                let info = claim_name(CollectionInfo::new(label, &creator, now).admin_only(), &taken);
                taken.insert(info.name.clone());
                self.write_collection(mou, info.clone(), previous_rows).await?;
                Some(info)
            }
            _ => None,
        };

        let info = claim_name(
            CollectionInfo::new(&load.label, &load.creator, now).admin_only(),
            &taken,
        );
        let current = info.name.clone();
        let n_records = records.len();
        self.write_collection(mou, info, records).await?;
        let previous = self.swap_alias(mou, &current, true).await?;
        info!(
            mou = %mou,
            collection = %current,
            previous = ?previous,
            records = n_records,
            history = imported_history.len(),
            "Live collection replaced"
        );

        Ok(BulkOutcome {
            previous,
            current,
            before,
            imported_history,
            n_records,
        })
    }

    /// Copy the live collection into a new numbered snapshot
    ///
    /// Returns the stored metadata; the name moves forward past taken ones.
    async fn create_snapshot(&self, mou: &str, info: CollectionInfo) -> Result<CollectionInfo> {
        let _guard = self.locks().lock(mou).await;
        if self.live_collection_name(mou).await?.is_none() {
            return Err(MouError::NotFound(format!("MoU '{}' has no live collection", mou)));
        }
        let info = claim_name(info, &self.collection_names(mou).await?);
        let records = self.get_live(mou).await?;
        self.write_collection(mou, info.clone(), records).await?;
        info!(mou = %mou, snapshot = %info.name, label = %info.label, "Snapshot created");
        Ok(info)
    }

    /// Names of every stored collection
    async fn collection_names(&self, mou: &str) -> Result<HashSet<String>> {
        Ok(self
            .list_collections(mou)
            .await?
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    /// Give a MoU an empty live collection if it has none
    async fn ensure_live(&self, mou: &str) -> Result<()> {
        let _guard = self.locks().lock(mou).await;
        if self.live_collection_name(mou).await?.is_some() {
            return Ok(());
        }
        let info = CollectionInfo::new("Initial", "server", Utc::now());
        let name = info.name.clone();
        self.write_collection(mou, info, Vec::new()).await?;
        self.swap_alias(mou, &name, false).await?;
        info!(mou = %mou, collection = %name, "Created empty live collection");
        Ok(())
    }
}

/// A bulk load performed by [`RecordStore::replace_from_live`]
#[derive(Debug, Clone, Default)]
pub struct BulkLoad {
    /// Label of the collection that becomes live
    pub label: String,
    pub creator: String,
    /// Label of the admin-only copy taken of non-empty previous live rows
    pub before_label: Option<String>,
    /// Historical collections written alongside; existing names are skipped
    pub history: Vec<(CollectionInfo, Vec<TaskRecord>)>,
}

/// What a locked bulk load wrote
#[derive(Debug, Clone)]
pub struct BulkOutcome {
    /// Collection that was live before the load
    pub previous: Option<String>,
    pub current: String,
    pub before: Option<CollectionInfo>,
    pub imported_history: Vec<String>,
    pub n_records: usize,
}

/// Move `info` to the first millisecond whose collection name is unused
pub(crate) fn claim_name(mut info: CollectionInfo, taken: &HashSet<String>) -> CollectionInfo {
    while taken.contains(&info.name) {
        info.created_at += Duration::milliseconds(1);
        info.name = snapshot_name(info.created_at);
    }
    info
}

/// Reject a batch of records that repeats a row id
pub(crate) fn check_unique_rows(records: &[TaskRecord]) -> Result<()> {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(&record.row_id) {
            return Err(MouError::Validation(format!(
                "duplicate row id '{}'",
                record.row_id
            )));
        }
    }
    Ok(())
}

/// Row ids whose precondition fails against `lookup`
pub(crate) fn conflicting_rows<'a, F>(ops: &[TxOp], mut lookup: F) -> Vec<RowId>
where
    F: FnMut(&RowId) -> Option<&'a TaskRecord>,
{
    ops.iter()
        .filter(|op| !op.precondition_holds(lookup(op.row_id())))
        .map(|op| op.row_id().clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordBody;

    fn row(id: &str, revision: u64) -> TaskRecord {
        let mut body = RecordBody::task("UW-Madison", 2023);
        body.fte = Some(1.0);
        let mut marker = Marker::origin();
        marker.revision = revision;
        TaskRecord::new(RowId::from(id), body, marker)
    }

    #[test]
    fn test_preconditions() {
        let existing = row("r1", 3);

        assert!(TxOp::Insert(row("r2", 0)).precondition_holds(None));
        assert!(!TxOp::Insert(row("r1", 0)).precondition_holds(Some(&existing)));

        let update = TxOp::Update {
            record: row("r1", 4),
            expected: existing.marker.clone(),
        };
        assert!(update.precondition_holds(Some(&existing)));
        assert!(!update.precondition_holds(None));

        let stale = TxOp::Purge {
            row_id: RowId::from("r1"),
            expected: row("r1", 2).marker,
        };
        assert!(!stale.precondition_holds(Some(&existing)));
    }

    #[test]
    fn test_claim_name_skips_taken_milliseconds() {
        let info = CollectionInfo::new("Weekly", "alice", Utc::now());
        let first = info.name.clone();
        let taken: HashSet<String> = [first.clone()].into_iter().collect();

        let claimed = claim_name(info.clone(), &taken);
        assert_ne!(claimed.name, first);
        assert_eq!(claimed.created_at, info.created_at + Duration::milliseconds(1));
        assert_eq!(claim_name(info, &HashSet::new()).name, first);
    }

    #[tokio::test]
    async fn test_locks_are_per_mou() {
        let locks = MouLocks::new();
        let _mo = locks.lock("mo").await;
        // Different MoU does not wait
        let upgrade = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            locks.lock("upgrade"),
        )
        .await;
        assert!(upgrade.is_ok());

        let same = tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock("mo")).await;
        assert!(same.is_err());
    }
}
