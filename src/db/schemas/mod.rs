//! MongoDB document schemas
//!
//! Task rows and collection metadata are stored as their API types; the
//! alias pointer and confirmation state have dedicated document types.

mod alias;
mod collection_info;
mod confirmation;
mod record;

pub use alias::{AliasDoc, ALIAS_COLLECTION};
pub use confirmation::{ConfirmationDoc, CONFIRMATION_COLLECTION};
pub use collection_info::COLLECTION_INFO_COLLECTION;
