//! Collection metadata documents

use bson::{doc, Document};
use mongodb::options::IndexOptions;

use crate::db::mongo::IntoIndexes;
use crate::types::CollectionInfo;

/// Collection name for per-collection metadata
pub const COLLECTION_INFO_COLLECTION: &str = "_collections";

impl IntoIndexes for CollectionInfo {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("name_unique".to_string())
                    .build(),
            ),
        )]
    }
}
