//! Schema Migrator
//!
//! Detects the schema version of a raw dump from its collection layout and
//! rewrites legacy shapes into the current unified record shape:
//!
//! - **v3 (current)**: an alias for `LIVE_COLLECTION` naming an existing
//!   collection, and no supplemental collections
//! - **v2 (legacy)**: numbered collections, with the live one found through
//!   the alias, a literal `LIVE_COLLECTION` collection, or the highest
//!   number; institution-level values split into supplemental collections
//!
//! Migration is pure and deterministic: no clock reads, no random ids.
//! Loading the result into a store is the ingestion pipeline's job.

mod v2;

pub use v2::{
    migrate_v2_to_v3, parse_supplemental, LegacyTaskRow, SupplementalMeta, SupplementalRow,
};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::types::{
    collection_number, epoch, CollectionInfo, MouError, TaskRecord, LIVE_COLLECTION,
};

/// Schema generation of a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V2,
    V3,
}

/// Full export of one MoU's collections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDump {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mou: Option<String>,
    /// Alias name to collection name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Collection name to its documents
    pub collections: BTreeMap<String, Vec<Value>>,
    /// Legacy supplemental collections, keyed like `collections`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub supplemental: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collection_info: Vec<CollectionInfo>,
    /// Fiscal year for legacy rows without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiscal_year: Option<i32>,
}

/// Migration failures
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("dump contains no collections")]
    Empty,

    #[error("cannot tell which collection is live")]
    NoLiveCollection,

    #[error("collection '{collection}' row '{row}': {reason}")]
    Incompatible {
        collection: String,
        row: String,
        reason: String,
    },
}

impl MigrationError {
    fn incompatible(collection: &str, row: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Incompatible {
            collection: collection.to_string(),
            row: row.into(),
            reason: reason.into(),
        }
    }
}

impl From<MigrationError> for MouError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Incompatible {
                collection,
                row,
                reason,
            } => MouError::SchemaIncompatible {
                collection,
                row,
                reason,
            },
            other => MouError::MalformedSnapshot(other.to_string()),
        }
    }
}

/// A row in one of the supported schema generations
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedRow {
    V2(LegacyTaskRow),
    V3(TaskRecord),
}

impl VersionedRow {
    pub fn parse(version: SchemaVersion, doc: &Value) -> Result<Self, String> {
        match version {
            SchemaVersion::V2 => {
                let map = doc.as_object().ok_or("row is not an object")?;
                LegacyTaskRow::from_document(map).map(Self::V2)
            }
            SchemaVersion::V3 => serde_json::from_value(doc.clone())
                .map(Self::V3)
                .map_err(|e| e.to_string()),
        }
    }

    /// Bring the row up to the current shape
    pub fn into_current(self, default_fiscal_year: Option<i32>) -> Result<TaskRecord, String> {
        match self {
            Self::V2(row) => migrate_v2_to_v3(row, default_fiscal_year),
            Self::V3(record) => Ok(record),
        }
    }
}

/// One collection in the current shape, rows ordered by row id
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedCollection {
    pub info: CollectionInfo,
    pub records: Vec<TaskRecord>,
}

/// Result of migrating a dump
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedDump {
    pub version: SchemaVersion,
    pub live: MigratedCollection,
    /// Historical collections, oldest first
    pub history: Vec<MigratedCollection>,
}

impl MigratedDump {
    /// Re-export as a current-schema dump
    pub fn to_dump(&self, mou: &str) -> Result<RawDump, MouError> {
        let mut dump = RawDump {
            mou: Some(mou.to_string()),
            ..RawDump::default()
        };
        dump.aliases
            .insert(LIVE_COLLECTION.to_string(), self.live.info.name.clone());

        for collection in std::iter::once(&self.live).chain(&self.history) {
            let docs = collection
                .records
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MouError::Internal(format!("record serialization: {}", e)))?;
            dump.collections.insert(collection.info.name.clone(), docs);
            dump.collection_info.push(collection.info.clone());
        }
        Ok(dump)
    }
}

/// Detect the schema generation of a dump
pub fn detect_version(dump: &RawDump) -> SchemaVersion {
    let aliased = dump
        .aliases
        .get(LIVE_COLLECTION)
        .is_some_and(|target| dump.collections.contains_key(target));

    if aliased && dump.supplemental.is_empty() {
        SchemaVersion::V3
    } else {
        SchemaVersion::V2
    }
}

/// Name of the collection holding live rows
fn live_collection(dump: &RawDump) -> Result<&str, MigrationError> {
    if dump.collections.is_empty() {
        return Err(MigrationError::Empty);
    }
    if let Some(target) = dump.aliases.get(LIVE_COLLECTION) {
        if dump.collections.contains_key(target) {
            return Ok(target);
        }
    }
    if dump.collections.contains_key(LIVE_COLLECTION) {
        return Ok(LIVE_COLLECTION);
    }

    let numbered = dump
        .collections
        .keys()
        .filter_map(|name| collection_number(name).map(|n| (n, name)))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, name)| name.as_str());

    match numbered {
        Some(name) => Ok(name),
        None if dump.collections.len() == 1 => {
            Ok(dump.collections.keys().next().map(String::as_str).unwrap_or_default())
        }
        None => Err(MigrationError::NoLiveCollection),
    }
}

/// Migrate a dump into the current shape
pub fn migrate(dump: &RawDump) -> Result<MigratedDump, MigrationError> {
    let version = detect_version(dump);
    let live_name = live_collection(dump)?;

    let mut live = migrate_collection(dump, version, live_name, true)?;
    live.info.admin_only = false;

    let mut history = Vec::new();
    for name in dump.collections.keys().filter(|n| n.as_str() != live_name) {
        history.push(migrate_collection(dump, version, name, false)?);
    }
    history.sort_by(|a, b| {
        a.info
            .created_at
            .cmp(&b.info.created_at)
            .then_with(|| a.info.name.cmp(&b.info.name))
    });

    info!(
        version = ?version,
        live = %live.info.name,
        records = live.records.len(),
        history = history.len(),
        "Dump migrated"
    );

    Ok(MigratedDump {
        version,
        live,
        history,
    })
}

fn migrate_collection(
    dump: &RawDump,
    version: SchemaVersion,
    name: &str,
    is_live: bool,
) -> Result<MigratedCollection, MigrationError> {
    let docs = dump.collections.get(name).map(Vec::as_slice).unwrap_or_default();

    let mut records = Vec::with_capacity(docs.len());
    for (index, doc) in docs.iter().enumerate() {
        let row = row_label(doc, index);
        let record = VersionedRow::parse(version, doc)
            .and_then(|r| r.into_current(dump.fiscal_year))
            .map_err(|reason| MigrationError::incompatible(name, row, reason))?;
        records.push(record);
    }
    records.sort_by(|a, b| a.row_id.cmp(&b.row_id));

    let mut info = collection_info(dump, name);

    let mut supplemental_docs: Vec<Value> = dump.supplemental.get(name).cloned().unwrap_or_default();
    if is_live && name != LIVE_COLLECTION {
        if let Some(extra) = dump.supplemental.get(LIVE_COLLECTION) {
            supplemental_docs.extend(extra.iter().cloned());
        }
    }
    if !supplemental_docs.is_empty() {
        let (rows, meta) = parse_supplemental(&supplemental_docs)
            .map_err(|reason| MigrationError::incompatible(name, "supplemental", reason))?;
        if let Some(meta) = meta {
            meta.apply(&mut info);
        }
        merge_supplemental(name, &mut records, rows, dump.fiscal_year)?;
    }

    validate(name, &records)?;
    debug!(collection = %name, records = records.len(), "Collection migrated");

    Ok(MigratedCollection { info, records })
}

/// Fold institution-level values into the unified records
///
/// Each supplemental row fills the unset fields of the lowest-id live row of
/// its institution (and fiscal year, when given). Institutions without rows
/// get an `institution_summary` record.
pub(crate) fn merge_supplemental(
    collection: &str,
    records: &mut Vec<TaskRecord>,
    rows: Vec<SupplementalRow>,
    default_fiscal_year: Option<i32>,
) -> Result<(), MigrationError> {
    for sup in rows {
        let target = records.iter_mut().find(|r| {
            !r.deleted
                && r.body.institution.eq_ignore_ascii_case(&sup.institution)
                && sup.fiscal_year.map_or(true, |fy| fy == r.body.fiscal_year)
        });

        if let Some(record) = target {
            record.body.headcounts.fill_from(&sup.headcounts);
            record.body.computing.fill_from(&sup.computing);
            if record.body.notes.is_none() {
                record.body.notes = sup.notes;
            }
            continue;
        }

        let fiscal_year = sup
            .fiscal_year
            .or(default_fiscal_year)
            .or_else(|| records.first().map(|r| r.body.fiscal_year))
            .ok_or_else(|| {
                MigrationError::incompatible(
                    collection,
                    format!("supplemental:{}", sup.institution),
                    "no fiscal year for institution summary",
                )
            })?;
        records.push(sup.into_summary(fiscal_year));
        records.sort_by(|a, b| a.row_id.cmp(&b.row_id));
    }
    Ok(())
}

fn validate(collection: &str, records: &[TaskRecord]) -> Result<(), MigrationError> {
    let mut seen = HashSet::new();
    for record in records {
        if record.row_id.as_str().is_empty() {
            return Err(MigrationError::incompatible(collection, "", "empty row id"));
        }
        if !seen.insert(&record.row_id) {
            return Err(MigrationError::incompatible(
                collection,
                record.row_id.as_str(),
                "duplicate row id",
            ));
        }
        if record.marker.revision == u64::MAX {
            return Err(MigrationError::incompatible(
                collection,
                record.row_id.as_str(),
                "row revision counter is exhausted",
            ));
        }
        record
            .body
            .validate()
            .map_err(|reason| MigrationError::incompatible(collection, record.row_id.as_str(), reason))?;
    }
    Ok(())
}

fn collection_info(dump: &RawDump, name: &str) -> CollectionInfo {
    if let Some(info) = dump.collection_info.iter().find(|i| i.name == name) {
        return info.clone();
    }
    let created_at = collection_number(name)
        .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64))
        .unwrap_or_else(epoch);
    CollectionInfo {
        name: name.to_string(),
        label: "Migrated".to_string(),
        creator: "migration".to_string(),
        created_at,
        admin_only: false,
    }
}

fn row_label(doc: &Value, index: usize) -> String {
    let id = doc.get("row_id").or_else(|| doc.get("_id"));
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("$oid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", index)),
        _ => format!("#{}", index),
    }
}
