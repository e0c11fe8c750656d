//! Task record indexes

use bson::{doc, Document};
use mongodb::options::IndexOptions;

use crate::db::mongo::IntoIndexes;
use crate::types::TaskRecord;

impl IntoIndexes for TaskRecord {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on row_id
            (
                doc! { "row_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("row_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "institution": 1 },
                Some(
                    IndexOptions::builder()
                        .name("institution_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "labor_category": 1 },
                Some(
                    IndexOptions::builder()
                        .name("labor_category_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
