//! Database layer
//!
//! MongoDB storage for MoU collections, the live alias and collection
//! metadata.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection};
pub use schemas::{
    AliasDoc, ConfirmationDoc, ALIAS_COLLECTION, COLLECTION_INFO_COLLECTION,
    CONFIRMATION_COLLECTION,
};
