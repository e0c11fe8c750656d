//! Institution confirmation document
//!
//! A single document per MoU holds the touchstone and every institution's
//! edit and confirmation times.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::types::ConfirmationState;

/// Collection name for confirmation state
pub const CONFIRMATION_COLLECTION: &str = "_confirmations";

/// Id of the one confirmation document
pub const CONFIRMATION_DOC_ID: &str = "institution_values";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfirmationDoc {
    pub _id: String,
    #[serde(flatten)]
    pub state: ConfirmationState,
}

impl IntoIndexes for ConfirmationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        Vec::new()
    }
}

impl ConfirmationDoc {
    pub fn new(state: ConfirmationState) -> Self {
        Self {
            _id: CONFIRMATION_DOC_ID.to_string(),
            state,
        }
    }

    pub fn filter() -> Document {
        doc! { "_id": CONFIRMATION_DOC_ID }
    }
}
