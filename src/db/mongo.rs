//! MongoDB client and collection wrapper
//!
//! Each MoU lives in its own database (`{prefix}_{mou}`) so collection
//! names inside it can be plain snapshot names.

use bson::{doc, Document};
use mongodb::{
    options::{FindOptions, IndexOptions},
    Client, ClientSession, Collection, Database, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::types::MouError;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_prefix: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_prefix: &str) -> Result<Self, MouError> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri).await.map_err(|e| {
            MouError::StoreUnavailable(format!("Failed to connect to MongoDB: {}", e))
        })?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MouError::StoreUnavailable(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB (database prefix '{}')", db_prefix);

        Ok(Self {
            client,
            db_prefix: db_prefix.to_string(),
        })
    }

    /// Database holding every collection of one MoU
    pub fn mou_database(&self, mou: &str) -> Database {
        self.client
            .database(&format!("{}_{}", self.db_prefix, mou))
    }

    /// Get a typed collection of a MoU database, applying its indexes
    pub async fn collection<T>(&self, mou: &str, name: &str) -> Result<MongoCollection<T>, MouError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.mou_database(mou), name).await
    }

    /// Start a client session for multi-document transactions
    pub async fn start_session(&self) -> Result<ClientSession, MouError> {
        self.client
            .start_session()
            .await
            .map_err(|e| MouError::StoreUnavailable(format!("Failed to start session: {}", e)))
    }

    /// Get the raw MongoDB client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Open a collection and apply indexes
    pub async fn new(db: &Database, collection_name: &str) -> Result<Self, MouError> {
        let collection = db.collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<(), MouError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| MouError::StoreUnavailable(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Find many documents by filter, sorted by `sort`
    pub async fn find_many(&self, filter: Document, sort: Document) -> Result<Vec<T>, MouError> {
        use futures_util::TryStreamExt;

        let options = FindOptions::builder().sort(sort).build();
        let cursor = self
            .inner
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| MouError::StoreUnavailable(format!("Find failed: {}", e)))?;

        // Undecodable rows abort the read
        cursor.try_collect().await.map_err(|e| {
            error!("Error reading document: {}", e);
            MouError::SchemaIncompatible {
                collection: self.inner.name().to_string(),
                row: "?".into(),
                reason: e.to_string(),
            }
        })
    }

    /// Number of documents in the collection
    pub async fn count(&self) -> Result<u64, MouError> {
        self.inner
            .count_documents(doc! {})
            .await
            .map_err(|e| MouError::StoreUnavailable(format!("Count failed: {}", e)))
    }

    /// Get the underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}

