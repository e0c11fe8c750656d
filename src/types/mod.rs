//! Shared types: the record model and the error taxonomy

mod collection;
mod confirmation;
mod error;
mod record;
mod wbs;

pub use collection::{collection_number, snapshot_name, CollectionInfo};
pub use confirmation::{
    ConfirmationState, ConfirmationStatus, InstitutionConfirmation, InstitutionEdit, PartMetadata,
    ValueParts,
};
pub use error::{MouError, Result};
pub use record::{
    Computing, Headcounts, Marker, RecordBody, RecordKind, RowId, TaskRecord, FISCAL_YEAR_RANGE,
    LABOR_CATEGORIES,
};
pub(crate) use record::epoch;
pub use wbs::{wbs_tree, WbsMenus, WbsTree};

/// Alias name that always resolves to the live collection of a MoU
pub const LIVE_COLLECTION: &str = "LIVE_COLLECTION";

/// Check a MoU identifier is safe to use as a namespace component
pub fn is_valid_mou(mou: &str) -> bool {
    !mou.is_empty()
        && mou.len() <= 32
        && mou
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
