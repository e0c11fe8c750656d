//! Legacy (v2) row shapes
//!
//! v2 task rows are flat documents keyed by the dashboard's column titles,
//! with `.` escaped as `;`. Institution-level values live in separate
//! supplemental collections, either as one snapshot document carrying a
//! `snapshot_institution_values` map or as one row per institution.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::ingest::columns::{self, demongofy};
use crate::types::{
    CollectionInfo, Computing, Headcounts, Marker, RecordBody, RecordKind, RowId, TaskRecord,
};

/// A v2 task row after key unescaping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyTaskRow {
    pub id: Option<String>,
    pub institution: Option<String>,
    pub fiscal_year: Option<i32>,
    pub labor_category: Option<String>,
    pub wbs_l2: Option<String>,
    pub wbs_l3: Option<String>,
    pub names: Option<String>,
    pub description: Option<String>,
    pub source_of_funds: Option<String>,
    pub fte: Option<f64>,
    pub amount: Option<f64>,
    pub grand_total: Option<f64>,
    /// Seconds since the epoch
    pub edited_at: Option<f64>,
    pub editor: Option<String>,
    pub deleted: bool,
}

impl LegacyTaskRow {
    pub fn from_document(doc: &Map<String, Value>) -> Result<Self, String> {
        let mut row = Self::default();
        for (key, value) in doc {
            let key = demongofy(key);
            match key.as_str() {
                columns::ID => row.id = object_id(value),
                columns::INSTITUTION => row.institution = text(value),
                columns::FISCAL_YEAR | columns::FY => row.fiscal_year = year(value, &key)?,
                columns::LABOR_CAT => row.labor_category = text(value),
                columns::WBS_L2 => row.wbs_l2 = text(value),
                columns::WBS_L3 => row.wbs_l3 = text(value),
                columns::NAMES | columns::NAME => row.names = text(value),
                columns::TASK_DESCRIPTION | columns::TASKS => row.description = text(value),
                columns::SOURCE_OF_FUNDS => row.source_of_funds = text(value),
                columns::FTE => row.fte = number(value, &key)?,
                columns::AMOUNT => row.amount = number(value, &key)?,
                columns::GRAND_TOTAL => row.grand_total = number(value, &key)?,
                columns::TIMESTAMP => row.edited_at = number(value, &key)?,
                columns::EDITOR => row.editor = text(value),
                columns::DELETED => row.deleted = value.as_bool().unwrap_or(false),
                // Derived and unknown legacy columns carry nothing we keep
                _ => {}
            }
        }
        Ok(row)
    }
}

/// Translate a v2 row into the current record shape
///
/// `default_fiscal_year` applies to rows from dumps that predate the
/// fiscal year column.
pub fn migrate_v2_to_v3(
    row: LegacyTaskRow,
    default_fiscal_year: Option<i32>,
) -> Result<TaskRecord, String> {
    let row_id = row.id.ok_or("missing _id")?;
    let institution = row.institution.ok_or("missing Institution")?;
    let fiscal_year = row
        .fiscal_year
        .or(default_fiscal_year)
        .ok_or("missing Fiscal Year")?;

    let marker = match row.edited_at {
        Some(secs) => Marker::loaded(
            row.editor.as_deref().unwrap_or(""),
            seconds_to_datetime(secs)?,
        ),
        None => Marker::origin(),
    };

    let mut body = RecordBody::task(&institution, fiscal_year);
    body.labor_category = row.labor_category;
    body.wbs_l2 = row.wbs_l2;
    body.wbs_l3 = row.wbs_l3;
    body.names = row.names;
    body.description = row.description;
    body.source_of_funds = row.source_of_funds;
    body.fte = row.fte.or(row.grand_total);
    body.amount = row.amount;

    let mut record = TaskRecord::new(RowId::from(row_id), body, marker);
    record.deleted = row.deleted;
    Ok(record)
}

/// Institution-level values from a supplemental collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupplementalRow {
    pub institution: String,
    pub fiscal_year: Option<i32>,
    pub headcounts: Headcounts,
    pub computing: Computing,
    pub notes: Option<String>,
}

impl SupplementalRow {
    fn from_values(institution: &str, values: &Map<String, Value>) -> Result<Self, String> {
        let count = |key: &str| -> Result<Option<u32>, String> {
            match values.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
                    Some(n) => Ok(Some(n)),
                    // The dashboard stored "unset" as -1
                    None if v.as_i64() == Some(-1) => Ok(None),
                    None => Err(format!("'{}' is not a non-negative count: {}", key, v)),
                },
            }
        };

        let fiscal_year = match values.get(columns::FISCAL_YEAR).or(values.get("fiscal_year")) {
            Some(v) => year(v, columns::FISCAL_YEAR)?,
            None => None,
        };

        Ok(Self {
            institution: institution.to_string(),
            fiscal_year,
            headcounts: Headcounts {
                phds_authors: count("phds_authors")?,
                faculty: count("faculty")?,
                scientists_post_docs: count("scientists_post_docs")?,
                grad_students: count("grad_students")?,
            },
            computing: Computing {
                cpus: count("cpus")?,
                gpus: count("gpus")?,
            },
            notes: values
                .get("text")
                .or(values.get("notes"))
                .and_then(text),
        })
    }

    /// Summary record for an institution without task rows
    pub fn into_summary(self, fiscal_year: i32) -> TaskRecord {
        let mut body = RecordBody::task(&self.institution, fiscal_year);
        body.kind = RecordKind::InstitutionSummary;
        body.headcounts = self.headcounts;
        body.computing = self.computing;
        body.notes = self.notes;
        TaskRecord::new(
            RowId::summary(&self.institution, fiscal_year),
            body,
            Marker::origin(),
        )
    }
}

/// Snapshot metadata carried by a supplemental snapshot document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupplementalMeta {
    pub label: Option<String>,
    pub creator: Option<String>,
    pub admin_only: bool,
}

impl SupplementalMeta {
    pub fn apply(&self, info: &mut CollectionInfo) {
        if let Some(ref label) = self.label {
            info.label = label.clone();
        }
        if let Some(ref creator) = self.creator {
            info.creator = creator.clone();
        }
        info.admin_only = self.admin_only;
    }
}

/// Parse every document of a supplemental collection
pub fn parse_supplemental(
    docs: &[Value],
) -> Result<(Vec<SupplementalRow>, Option<SupplementalMeta>), String> {
    let mut rows = Vec::new();
    let mut meta = None;

    for doc in docs {
        let doc = doc
            .as_object()
            .ok_or_else(|| format!("supplemental entry is not an object: {}", doc))?;

        if let Some(values) = doc.get("snapshot_institution_values") {
            let values = values
                .as_object()
                .ok_or("snapshot_institution_values is not an object")?;
            for (institution, inst_values) in values {
                let inst_values = inst_values
                    .as_object()
                    .ok_or_else(|| format!("values of '{}' are not an object", institution))?;
                rows.push(SupplementalRow::from_values(institution, inst_values)?);
            }
            meta = Some(SupplementalMeta {
                label: doc.get("name").and_then(text),
                creator: doc.get("creator").and_then(text),
                admin_only: doc
                    .get("admin_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
            continue;
        }

        let unescaped: Map<String, Value> = doc
            .iter()
            .map(|(k, v)| (demongofy(k), v.clone()))
            .collect();
        let institution = unescaped
            .get(columns::INSTITUTION)
            .or(unescaped.get("institution"))
            .and_then(text)
            .ok_or("supplemental row without Institution")?;
        rows.push(SupplementalRow::from_values(&institution, &unescaped)?);
    }

    Ok((rows, meta))
}

fn seconds_to_datetime(secs: f64) -> Result<DateTime<Utc>, String> {
    if !secs.is_finite() {
        return Err(format!("invalid edit timestamp {}", secs));
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
        .ok_or_else(|| format!("edit timestamp {} out of range", secs))
}

fn object_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("$oid").and_then(text),
        other => text(other),
    }
}

/// Non-empty trimmed text; numbers are rendered as text
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: &Value, key: &str) -> Result<Option<f64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("'{}' is not a number: {:?}", key, s)),
        other => Err(format!("'{}' is not a number: {}", key, other)),
    }
}

fn year(value: &Value, key: &str) -> Result<Option<i32>, String> {
    match number(value, key)? {
        None => Ok(None),
        Some(y) if y.fract() == 0.0 && y.abs() < i32::MAX as f64 => Ok(Some(y as i32)),
        Some(y) => Err(format!("'{}' is not a year: {}", key, y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_legacy_row_with_escaped_keys() {
        let row = LegacyTaskRow::from_document(&doc(json!({
            "_id": {"$oid": "5f1e0c2a9b1e8a0001aa0001"},
            "Institution": "UW-Madison",
            "Labor Cat;": "SC",
            "FTE": "0.5",
            "Task Description": "Calibration",
            "Date & Time of Last Edit": 1600000000.25,
            "Name of Last Editor": "alice",
            "US / Non-US": "US",
        })))
        .unwrap();

        assert_eq!(row.id.as_deref(), Some("5f1e0c2a9b1e8a0001aa0001"));
        assert_eq!(row.labor_category.as_deref(), Some("SC"));
        assert_eq!(row.fte, Some(0.5));

        let record = migrate_v2_to_v3(row, Some(2021)).unwrap();
        assert_eq!(record.body.fiscal_year, 2021);
        assert_eq!(record.marker.actor, "alice");
        assert_eq!(record.marker.timestamp.timestamp_millis(), 1_600_000_000_250);
        assert!(!record.deleted);
    }

    #[test]
    fn test_grand_total_fills_missing_fte() {
        let row = LegacyTaskRow::from_document(&doc(json!({
            "_id": "r1", "Institution": "DESY", "Fiscal Year": 2022, "Grand Total": 1.25,
        })))
        .unwrap();
        let record = migrate_v2_to_v3(row, None).unwrap();
        assert_eq!(record.body.fte, Some(1.25));
    }

    #[test]
    fn test_missing_required_fields() {
        let no_id = LegacyTaskRow::from_document(&doc(json!({"Institution": "DESY"}))).unwrap();
        assert_eq!(migrate_v2_to_v3(no_id, Some(2022)).unwrap_err(), "missing _id");

        let no_year =
            LegacyTaskRow::from_document(&doc(json!({"_id": "x", "Institution": "DESY"}))).unwrap();
        assert!(migrate_v2_to_v3(no_year, None).is_err());

        assert!(LegacyTaskRow::from_document(&doc(json!({"FTE": "lots"}))).is_err());
    }

    #[test]
    fn test_parse_snapshot_document() {
        let (rows, meta) = parse_supplemental(&[json!({
            "name": "Fall Review",
            "timestamp": "1600000000.000",
            "creator": "bob",
            "admin_only": false,
            "snapshot_institution_values": {
                "DESY": {"phds_authors": 4, "faculty": -1, "cpus": 100, "text": "note"},
            },
        })])
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].headcounts.phds_authors, Some(4));
        assert_eq!(rows[0].headcounts.faculty, None);
        assert_eq!(rows[0].computing.cpus, Some(100));
        assert_eq!(rows[0].notes.as_deref(), Some("note"));
        assert_eq!(meta.unwrap().label.as_deref(), Some("Fall Review"));
    }

    #[test]
    fn test_summary_record_is_deterministic() {
        let row = SupplementalRow {
            institution: "DESY".into(),
            headcounts: Headcounts {
                faculty: Some(3),
                ..Headcounts::default()
            },
            ..SupplementalRow::default()
        };
        let a = row.clone().into_summary(2023);
        let b = row.into_summary(2023);
        assert_eq!(a, b);
        assert_eq!(a.row_id.as_str(), "summary:DESY:2023");
        assert_eq!(a.body.kind, RecordKind::InstitutionSummary);
        assert!(a.body.validate().is_ok());
    }
}
