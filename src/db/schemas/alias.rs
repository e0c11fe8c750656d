//! Live-collection alias document
//!
//! One document per alias name; swapping the live collection is a single
//! document update, which MongoDB applies atomically.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for alias pointers
pub const ALIAS_COLLECTION: &str = "_aliases";

/// Alias pointer stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AliasDoc {
    /// Alias name, e.g. `LIVE_COLLECTION`
    pub _id: String,

    /// Name of the collection the alias resolves to
    pub collection: String,

    /// When the alias last moved
    pub swapped_at: DateTime,
}

impl IntoIndexes for AliasDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        // _id is indexed implicitly
        Vec::new()
    }
}

impl AliasDoc {
    pub fn filter(alias: &str) -> Document {
        doc! { "_id": alias }
    }
}
