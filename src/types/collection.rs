//! Collection metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata kept for every stored collection of a MoU
///
/// Collections other than the one the live alias points at are historical
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name, a creation timestamp in seconds (e.g. `1700000000.123`)
    pub name: String,
    /// Human label ("Initial Import", "Before Import", a user-supplied name)
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub creator: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Hidden from non-admin snapshot listings
    #[serde(default)]
    pub admin_only: bool,
}

impl CollectionInfo {
    /// New collection named after `created_at`
    pub fn new(label: &str, creator: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            name: snapshot_name(created_at),
            label: label.to_string(),
            creator: creator.to_string(),
            created_at,
            admin_only: false,
        }
    }

    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }
}

/// Timestamp collection name with millisecond resolution
pub fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("{}.{:03}", at.timestamp(), at.timestamp_subsec_millis())
}

/// Parse a numbered collection name back into a sortable value
pub fn collection_number(name: &str) -> Option<f64> {
    name.parse::<f64>().ok().filter(|n| n.is_finite())
}
