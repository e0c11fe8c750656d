//! MongoDB record store
//!
//! Layout per MoU database:
//! - one collection per numbered snapshot, holding `TaskRecord` documents
//! - `_aliases`: the `LIVE_COLLECTION` pointer
//! - `_collections`: `CollectionInfo` for every snapshot
//! - `_confirmations`: institution edit and confirmation times
//!
//! Transactions run inside a MongoDB multi-document transaction and need a
//! replica-set deployment.

use async_trait::async_trait;
use bson::{doc, DateTime};
use mongodb::ClientSession;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{check_unique_rows, conflicting_rows, MouLocks, RecordStore, TxOp};
use crate::db::{
    AliasDoc, ConfirmationDoc, IntoIndexes, MongoClient, MongoCollection, ALIAS_COLLECTION,
    COLLECTION_INFO_COLLECTION, CONFIRMATION_COLLECTION,
};
use crate::types::{
    CollectionInfo, ConfirmationState, MouError, Result, RowId, TaskRecord, LIVE_COLLECTION,
};

/// Record store backed by MongoDB
pub struct MongoStore {
    mongo: MongoClient,
    locks: MouLocks,
}

fn row_filter(row_id: &RowId) -> bson::Document {
    doc! { "row_id": row_id.as_str() }
}

fn marker_bson(marker: &crate::types::Marker) -> Result<bson::Bson> {
    bson::to_bson(marker).map_err(|e| MouError::Internal(format!("marker encoding: {}", e)))
}

impl MongoStore {
    pub fn new(mongo: MongoClient) -> Self {
        Self {
            mongo,
            locks: MouLocks::new(),
        }
    }

    fn open<T>(&self, mou: &str, name: &str) -> mongodb::Collection<T>
    where
        T: Send + Sync,
    {
        self.mongo.mou_database(mou).collection::<T>(name)
    }

    async fn indexed<T>(&self, mou: &str, name: &str) -> Result<MongoCollection<T>>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        self.mongo.collection::<T>(mou, name).await
    }

    async fn info(&self, mou: &str, name: &str) -> Result<Option<CollectionInfo>> {
        Ok(self
            .open::<CollectionInfo>(mou, COLLECTION_INFO_COLLECTION)
            .find_one(doc! { "name": name })
            .await?)
    }

    async fn rows(&self, mou: &str, name: &str) -> Result<Vec<TaskRecord>> {
        use futures_util::TryStreamExt;

        let cursor = self
            .open::<TaskRecord>(mou, name)
            .find(doc! {})
            .sort(doc! { "row_id": 1 })
            .await?;
        cursor.try_collect().await.map_err(|e| MouError::SchemaIncompatible {
            collection: name.to_string(),
            row: "?".into(),
            reason: e.to_string(),
        })
    }

    async fn commit_in_session(
        &self,
        rows: &mongodb::Collection<TaskRecord>,
        ops: &[TxOp],
        session: &mut ClientSession,
    ) -> Result<()> {
        let mut current: HashMap<RowId, TaskRecord> = HashMap::new();
        for op in ops {
            if let Some(row) = rows
                .find_one(row_filter(op.row_id()))
                .session(&mut *session)
                .await?
            {
                current.insert(row.row_id.clone(), row);
            }
        }

        let conflicts = conflicting_rows(ops, |id| current.get(id));
        if !conflicts.is_empty() {
            return Err(MouError::Conflict(conflicts));
        }

        for op in ops {
            match op {
                TxOp::Insert(record) => {
                    rows.insert_one(record).session(&mut *session).await?;
                }
                TxOp::Update { record, .. } => {
                    rows.replace_one(row_filter(&record.row_id), record)
                        .session(&mut *session)
                        .await?;
                }
                TxOp::Delete { row_id, marker, .. } => {
                    rows.update_one(
                        row_filter(row_id),
                        doc! { "$set": { "deleted": true, "marker": marker_bson(marker)? } },
                    )
                    .session(&mut *session)
                    .await?;
                }
                TxOp::Restore { row_id, marker, .. } => {
                    rows.update_one(
                        row_filter(row_id),
                        doc! { "$set": { "deleted": false, "marker": marker_bson(marker)? } },
                    )
                    .session(&mut *session)
                    .await?;
                }
                TxOp::Purge { row_id, .. } => {
                    rows.delete_one(row_filter(row_id))
                        .session(&mut *session)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MongoStore {
    async fn get_live(&self, mou: &str) -> Result<Vec<TaskRecord>> {
        match self.live_collection_name(mou).await? {
            Some(name) => self.rows(mou, &name).await,
            None => Ok(Vec::new()),
        }
    }

    async fn get_collection(&self, mou: &str, name: &str) -> Result<Vec<TaskRecord>> {
        if self.info(mou, name).await?.is_none() {
            return Err(MouError::NotFound(format!(
                "collection '{}' of MoU '{}'",
                name, mou
            )));
        }
        self.rows(mou, name).await
    }

    async fn live_collection_name(&self, mou: &str) -> Result<Option<String>> {
        let alias = self
            .open::<AliasDoc>(mou, ALIAS_COLLECTION)
            .find_one(AliasDoc::filter(LIVE_COLLECTION))
            .await?;
        Ok(alias.map(|a| a.collection))
    }

    async fn list_collections(&self, mou: &str) -> Result<Vec<CollectionInfo>> {
        self.indexed::<CollectionInfo>(mou, COLLECTION_INFO_COLLECTION)
            .await?
            .find_many(doc! {}, doc! { "created_at": 1 })
            .await
    }

    fn locks(&self) -> &MouLocks {
        &self.locks
    }

    async fn commit_ops(&self, mou: &str, ops: &[TxOp]) -> Result<()> {
        let name = self.live_collection_name(mou).await?.ok_or_else(|| {
            MouError::StoreUnavailable(format!("MoU '{}' has no live collection", mou))
        })?;
        let rows = self.open::<TaskRecord>(mou, &name);

        let mut session = self.mongo.start_session().await?;
        session.start_transaction().await?;

        match self.commit_in_session(&rows, ops, &mut session).await {
            Ok(()) => {
                session.commit_transaction().await?;
                debug!(mou = %mou, collection = %name, ops = ops.len(), "Mongo transaction committed");
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = session.abort_transaction().await {
                    warn!(mou = %mou, error = %abort, "Failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    async fn swap_alias(
        &self,
        mou: &str,
        collection: &str,
        require_non_empty: bool,
    ) -> Result<Option<String>> {
        if self.info(mou, collection).await?.is_none() {
            return Err(MouError::StoreUnavailable(format!(
                "collection '{}' does not exist",
                collection
            )));
        }
        if require_non_empty {
            let count = self
                .open::<TaskRecord>(mou, collection)
                .count_documents(doc! {})
                .await?;
            if count == 0 {
                return Err(MouError::StoreUnavailable(format!(
                    "collection '{}' is empty",
                    collection
                )));
            }
        }

        let previous = self.live_collection_name(mou).await?;
        self.open::<AliasDoc>(mou, ALIAS_COLLECTION)
            .update_one(
                AliasDoc::filter(LIVE_COLLECTION),
                doc! { "$set": { "collection": collection, "swapped_at": DateTime::now() } },
            )
            .upsert(true)
            .await?;
        Ok(previous)
    }

    async fn write_collection(
        &self,
        mou: &str,
        info: CollectionInfo,
        records: Vec<TaskRecord>,
    ) -> Result<()> {
        check_unique_rows(&records)?;
        if self.info(mou, &info.name).await?.is_some() {
            return Err(MouError::StoreUnavailable(format!(
                "collection '{}' already exists",
                info.name
            )));
        }

        // Index creation also creates the collection, so empty loads exist too
        let rows = self.indexed::<TaskRecord>(mou, &info.name).await?;
        if !records.is_empty() {
            rows.inner().insert_many(&records).await?;
        }

        self.indexed::<CollectionInfo>(mou, COLLECTION_INFO_COLLECTION)
            .await?
            .inner()
            .insert_one(&info)
            .await?;
        Ok(())
    }

    async fn load_confirmations(&self, mou: &str) -> Result<ConfirmationState> {
        let doc = self
            .open::<ConfirmationDoc>(mou, CONFIRMATION_COLLECTION)
            .find_one(ConfirmationDoc::filter())
            .await?;
        Ok(doc.map(|d| d.state).unwrap_or_default())
    }

    async fn save_confirmations(&self, mou: &str, state: &ConfirmationState) -> Result<()> {
        self.open::<ConfirmationDoc>(mou, CONFIRMATION_COLLECTION)
            .replace_one(ConfirmationDoc::filter(), ConfirmationDoc::new(state.clone()))
            .upsert(true)
            .await?;
        Ok(())
    }
}
