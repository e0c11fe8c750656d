//! In-memory record store
//!
//! Collections are immutable `Arc` snapshots. A transaction copies the live
//! rows, applies the batch to the copy and swaps the new `Arc` in, so a
//! reader holding the old one keeps a consistent view.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{check_unique_rows, conflicting_rows, MouLocks, RecordStore, TxOp};
use crate::types::{CollectionInfo, ConfirmationState, MouError, Result, RowId, TaskRecord};

struct Collection {
    info: CollectionInfo,
    rows: BTreeMap<RowId, TaskRecord>,
}

#[derive(Default)]
struct MouSpace {
    collections: BTreeMap<String, Arc<Collection>>,
    live: Option<String>,
    confirmations: ConfirmationState,
}

/// Record store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    spaces: RwLock<HashMap<String, MouSpace>>,
    locks: MouLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn live(&self, mou: &str) -> Option<Arc<Collection>> {
        let spaces = self.spaces.read().await;
        let space = spaces.get(mou)?;
        let name = space.live.as_ref()?;
        space.collections.get(name).cloned()
    }

    async fn named(&self, mou: &str, name: &str) -> Option<Arc<Collection>> {
        let spaces = self.spaces.read().await;
        spaces.get(mou)?.collections.get(name).cloned()
    }
}

fn apply(rows: &mut BTreeMap<RowId, TaskRecord>, op: &TxOp) {
    match op {
        TxOp::Insert(record) => {
            rows.insert(record.row_id.clone(), record.clone());
        }
        TxOp::Update { record, .. } => {
            rows.insert(record.row_id.clone(), record.clone());
        }
        TxOp::Delete { row_id, marker, .. } => {
            if let Some(row) = rows.get_mut(row_id) {
                row.deleted = true;
                row.marker = marker.clone();
            }
        }
        TxOp::Restore { row_id, marker, .. } => {
            if let Some(row) = rows.get_mut(row_id) {
                row.deleted = false;
                row.marker = marker.clone();
            }
        }
        TxOp::Purge { row_id, .. } => {
            rows.remove(row_id);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_live(&self, mou: &str) -> Result<Vec<TaskRecord>> {
        Ok(self
            .live(mou)
            .await
            .map(|c| c.rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_collection(&self, mou: &str, name: &str) -> Result<Vec<TaskRecord>> {
        self.named(mou, name)
            .await
            .map(|c| c.rows.values().cloned().collect())
            .ok_or_else(|| MouError::NotFound(format!("collection '{}' of MoU '{}'", name, mou)))
    }

    async fn live_collection_name(&self, mou: &str) -> Result<Option<String>> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(mou).and_then(|s| s.live.clone()))
    }

    async fn list_collections(&self, mou: &str) -> Result<Vec<CollectionInfo>> {
        let spaces = self.spaces.read().await;
        let mut infos: Vec<CollectionInfo> = spaces
            .get(mou)
            .map(|s| s.collections.values().map(|c| c.info.clone()).collect())
            .unwrap_or_default();
        infos.sort_by_key(|i| i.created_at);
        Ok(infos)
    }

    fn locks(&self) -> &MouLocks {
        &self.locks
    }

    async fn commit_ops(&self, mou: &str, ops: &[TxOp]) -> Result<()> {
        let live = self.live(mou).await.ok_or_else(|| {
            MouError::StoreUnavailable(format!("MoU '{}' has no live collection", mou))
        })?;

        let conflicts = conflicting_rows(ops, |id| live.rows.get(id));
        if !conflicts.is_empty() {
            return Err(MouError::Conflict(conflicts));
        }

        let mut rows = live.rows.clone();
        for op in ops {
            apply(&mut rows, op);
        }
        let next = Arc::new(Collection {
            info: live.info.clone(),
            rows,
        });

        let mut spaces = self.spaces.write().await;
        let space = spaces.entry(mou.to_string()).or_default();
        space.collections.insert(next.info.name.clone(), next);
        debug!(mou = %mou, ops = ops.len(), "Memory transaction swapped in");
        Ok(())
    }

    async fn swap_alias(
        &self,
        mou: &str,
        collection: &str,
        require_non_empty: bool,
    ) -> Result<Option<String>> {
        let mut spaces = self.spaces.write().await;
        let space = spaces.entry(mou.to_string()).or_default();
        let target = space.collections.get(collection).ok_or_else(|| {
            MouError::StoreUnavailable(format!("collection '{}' does not exist", collection))
        })?;
        if require_non_empty && target.rows.is_empty() {
            return Err(MouError::StoreUnavailable(format!(
                "collection '{}' is empty",
                collection
            )));
        }
        Ok(space.live.replace(collection.to_string()))
    }

    async fn write_collection(
        &self,
        mou: &str,
        info: CollectionInfo,
        records: Vec<TaskRecord>,
    ) -> Result<()> {
        check_unique_rows(&records)?;
        let rows: BTreeMap<RowId, TaskRecord> = records
            .into_iter()
            .map(|r| (r.row_id.clone(), r))
            .collect();

        let mut spaces = self.spaces.write().await;
        let space = spaces.entry(mou.to_string()).or_default();
        if space.collections.contains_key(&info.name) {
            return Err(MouError::StoreUnavailable(format!(
                "collection '{}' already exists",
                info.name
            )));
        }
        space
            .collections
            .insert(info.name.clone(), Arc::new(Collection { info, rows }));
        Ok(())
    }

    async fn load_confirmations(&self, mou: &str) -> Result<ConfirmationState> {
        let spaces = self.spaces.read().await;
        Ok(spaces
            .get(mou)
            .map(|s| s.confirmations.clone())
            .unwrap_or_default())
    }

    async fn save_confirmations(&self, mou: &str, state: &ConfirmationState) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        spaces.entry(mou.to_string()).or_default().confirmations = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BulkLoad;
    use crate::types::{InstitutionEdit, Marker, RecordBody, ValueParts};
    use chrono::{Duration, Utc};

    fn record(id: &str, institution: &str, fte: f64) -> TaskRecord {
        let mut body = RecordBody::task(institution, 2023);
        body.fte = Some(fte);
        TaskRecord::new(RowId::from(id), body, Marker::origin())
    }

    async fn loaded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let info = CollectionInfo::new("Initial Import", "test", Utc::now());
        store
            .bulk_load(
                "mo",
                info,
                vec![record("r1", "UW-Madison", 1.0), record("r2", "DESY", 0.5)],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_empty_mou_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.get_live("mo").await.unwrap().is_empty());
        assert_eq!(store.live_collection_name("mo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bulk_load_orders_by_row_id() {
        let store = loaded_store().await;
        let rows = store.get_live("mo").await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_transaction_applies_all_ops() {
        let store = loaded_store().await;
        let now = Utc::now();
        let mut updated = record("r1", "UW-Madison", 2.0);
        updated.marker = Marker::origin().next("alice", now).unwrap();

        store
            .apply_transaction(
                "mo",
                vec![
                    TxOp::Update {
                        record: updated,
                        expected: Marker::origin(),
                    },
                    TxOp::Delete {
                        row_id: RowId::from("r2"),
                        expected: Marker::origin(),
                        marker: Marker::origin().next("alice", now).unwrap(),
                    },
                    TxOp::Insert(record("r3", "DESY", 0.25)),
                ],
            )
            .await
            .unwrap();

        let rows = store.get_live("mo").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].body.fte, Some(2.0));
        assert!(rows[1].deleted);
        assert_eq!(rows[1].marker.revision, 1);
        assert_eq!(rows[2].row_id.as_str(), "r3");
    }

    #[tokio::test]
    async fn test_conflict_leaves_live_untouched() {
        let store = loaded_store().await;
        let before = store.get_live("mo").await.unwrap();

        let stale = Marker::origin()
            .next("bob", Utc::now() - Duration::seconds(5))
            .unwrap();
        let result = store
            .apply_transaction(
                "mo",
                vec![
                    TxOp::Insert(record("r9", "DESY", 1.0)),
                    TxOp::Purge {
                        row_id: RowId::from("r1"),
                        expected: stale,
                    },
                    TxOp::Insert(record("r2", "DESY", 1.0)),
                ],
            )
            .await;

        match result {
            Err(MouError::Conflict(ids)) => {
                assert_eq!(ids, vec![RowId::from("r1"), RowId::from("r2")]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.get_live("mo").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reader_keeps_old_snapshot() {
        let store = loaded_store().await;
        let held = store.live("mo").await.unwrap();

        store
            .apply_transaction("mo", vec![TxOp::Insert(record("r3", "DESY", 1.0))])
            .await
            .unwrap();

        assert_eq!(held.rows.len(), 2);
        assert_eq!(store.get_live("mo").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_replace_live_rejects_missing_and_empty() {
        let store = loaded_store().await;
        let live = store.live_collection_name("mo").await.unwrap();

        let missing = store.replace_live("mo", "12345.000", false).await;
        assert!(matches!(missing, Err(MouError::StoreUnavailable(_))));

        let empty = CollectionInfo::new("empty", "test", Utc::now() + Duration::seconds(1));
        let empty_name = empty.name.clone();
        let _guard = store.locks().lock("mo").await;
        store.write_collection("mo", empty, Vec::new()).await.unwrap();
        drop(_guard);

        let result = store.replace_live("mo", &empty_name, true).await;
        assert!(matches!(result, Err(MouError::StoreUnavailable(_))));
        assert_eq!(store.live_collection_name("mo").await.unwrap(), live);

        let previous = store.replace_live("mo", &empty_name, false).await.unwrap();
        assert_eq!(previous, live);
        assert!(store.get_live("mo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_keeps_previous_as_snapshot() {
        let store = loaded_store().await;
        let first = store.live_collection_name("mo").await.unwrap().unwrap();

        let info = CollectionInfo::new("Re-import", "test", Utc::now() + Duration::seconds(2));
        let previous = store
            .bulk_load("mo", info, vec![record("x1", "DESY", 3.0)])
            .await
            .unwrap();

        assert_eq!(previous.as_deref(), Some(first.as_str()));
        assert_eq!(store.get_collection("mo", &first).await.unwrap().len(), 2);
        assert_eq!(store.get_live("mo").await.unwrap().len(), 1);
        assert_eq!(store.list_collections("mo").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_and_ensure_live() {
        let store = MemoryStore::new();
        store.ensure_live("upgrade").await.unwrap();
        assert!(store.live_collection_name("upgrade").await.unwrap().is_some());

        store
            .apply_transaction("upgrade", vec![TxOp::Insert(record("u1", "DESY", 1.0))])
            .await
            .unwrap();

        let info = CollectionInfo::new("Weekly", "alice", Utc::now() + Duration::seconds(3));
        let snap = store.create_snapshot("upgrade", info).await.unwrap();
        let rows = store.get_collection("upgrade", &snap.name).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_from_live_snapshots_previous_rows() {
        let store = loaded_store().await;
        let first = store.live_collection_name("mo").await.unwrap().unwrap();
        let old = CollectionInfo::new("Old", "migration", Utc::now() - Duration::days(30));

        let load = BulkLoad {
            label: "Initial Import".into(),
            creator: "admin".into(),
            before_label: Some("Before Import".into()),
            history: vec![(old.clone(), vec![record("o1", "DESY", 1.0)])],
        };
        let outcome = store
            .replace_from_live("mo", load.clone(), &|previous: &[TaskRecord]| -> Result<Vec<TaskRecord>> {
                assert_eq!(previous.len(), 2);
                Ok(vec![record("x1", "DESY", 3.0)])
            })
            .await
            .unwrap();

        assert_eq!(outcome.previous.as_deref(), Some(first.as_str()));
        assert_eq!(outcome.imported_history, vec![old.name.clone()]);
        let before = outcome.before.unwrap();
        assert!(before.admin_only);
        assert_eq!(before.creator, "admin (auto)");
        assert_eq!(store.get_collection("mo", &before.name).await.unwrap().len(), 2);
        assert_eq!(store.get_live("mo").await.unwrap().len(), 1);

        // History already present is not written twice
        let again = store
            .replace_from_live("mo", load, &|_: &[TaskRecord]| -> Result<Vec<TaskRecord>> {
                Ok(vec![record("y1", "DESY", 1.0)])
            })
            .await
            .unwrap();
        assert!(again.imported_history.is_empty());
        assert_ne!(again.current, outcome.current);
    }

    #[tokio::test]
    async fn test_replace_from_live_refuses_empty_result() {
        let store = loaded_store().await;
        let live = store.live_collection_name("mo").await.unwrap();
        let result = store
            .replace_from_live("mo", BulkLoad::default(), &|_: &[TaskRecord]| -> Result<Vec<TaskRecord>> {
                Ok(Vec::new())
            })
            .await;
        assert!(matches!(result, Err(MouError::Validation(_))));
        assert_eq!(store.live_collection_name("mo").await.unwrap(), live);
        assert_eq!(store.list_collections("mo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_stamps_edits_only_on_commit() {
        let store = loaded_store().await;
        let table = ValueParts {
            table: true,
            ..ValueParts::default()
        };
        let edit = InstitutionEdit {
            institution: "DESY".into(),
            parts: table,
            at: Utc::now(),
        };

        // A conflicting batch leaves no stamp
        let result = store
            .apply_batch("mo", vec![TxOp::Insert(record("r1", "DESY", 1.0))], &[edit.clone()])
            .await;
        assert!(matches!(result, Err(MouError::Conflict(_))));
        assert!(store.load_confirmations("mo").await.unwrap().status("DESY").table_confirmed);

        store
            .apply_batch("mo", vec![TxOp::Insert(record("r3", "DESY", 1.0))], &[edit])
            .await
            .unwrap();
        let state = store.load_confirmations("mo").await.unwrap();
        assert!(!state.status("DESY").table_confirmed);
        assert!(state.status("UW-Madison").table_confirmed);

        // Bulk loads leave confirmation state alone
        store
            .bulk_load(
                "mo",
                CollectionInfo::new("Re-import", "test", Utc::now() + Duration::seconds(4)),
                vec![record("z1", "DESY", 1.0)],
            )
            .await
            .unwrap();
        assert_eq!(store.load_confirmations("mo").await.unwrap(), state);
    }
}
