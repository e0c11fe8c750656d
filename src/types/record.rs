//! Task record model
//!
//! One row of committed work inside a MoU live collection. The body holds
//! everything a client can edit; the row id, marker and deletion flag are
//! owned by the server.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::MouError;

/// Labor categories accepted in the `labor_category` column
pub const LABOR_CATEGORIES: &[&str] = &[
    "AD", "CS", "DS", "EN", "GR", "IT", "KE", "MA", "PO", "SC", "WO",
];

/// Fiscal years outside this range are treated as typos
pub const FISCAL_YEAR_RANGE: std::ops::RangeInclusive<i32> = 2000..=2100;

/// Stable row identifier, unique within a collection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    /// Generate a fresh random row id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Deterministic id for an institution-level summary row
    pub fn summary(institution: &str, fiscal_year: i32) -> Self {
        Self(format!("summary:{}:{}", institution, fiscal_year))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Last-modified marker used for optimistic concurrency
///
/// `revision` increases by one on every mutation, so two edits within the
/// same clock tick still produce distinct markers. Timestamps are kept at
/// millisecond precision, the resolution they are serialized with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub revision: u64,
    #[serde(default)]
    pub actor: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Marker {
    /// Marker for rows that have never been edited through the server
    pub fn origin() -> Self {
        Self {
            revision: 0,
            actor: String::new(),
            timestamp: epoch(),
        }
    }

    /// Marker for a freshly loaded row
    pub fn loaded(actor: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            revision: 0,
            actor: actor.to_string(),
            timestamp: timestamp.trunc_subsecs(3),
        }
    }

    /// Successor marker after a mutation by `actor`
    ///
    /// Fails once the revision counter is exhausted.
    pub fn next(&self, actor: &str, timestamp: DateTime<Utc>) -> Result<Self, MouError> {
        let revision = self
            .revision
            .checked_add(1)
            .ok_or_else(|| MouError::Validation("row revision counter overflow".into()))?;
        Ok(Self {
            revision,
            actor: actor.to_string(),
            timestamp: timestamp.trunc_subsecs(3),
        })
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::origin()
    }
}

pub(crate) fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// What a row represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// An ordinary statement-of-work task
    #[default]
    Task,
    /// Institution-level values with no task attached
    InstitutionSummary,
}

/// Institution headcounts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headcounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phds_authors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faculty: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scientists_post_docs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_students: Option<u32>,
}

impl Headcounts {
    pub fn is_empty(&self) -> bool {
        self.phds_authors.is_none()
            && self.faculty.is_none()
            && self.scientists_post_docs.is_none()
            && self.grad_students.is_none()
    }

    /// Fill every unset field from `other`
    pub fn fill_from(&mut self, other: &Headcounts) {
        self.phds_authors = self.phds_authors.or(other.phds_authors);
        self.faculty = self.faculty.or(other.faculty);
        self.scientists_post_docs = self.scientists_post_docs.or(other.scientists_post_docs);
        self.grad_students = self.grad_students.or(other.grad_students);
    }
}

/// Institution computing contribution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Computing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
}

impl Computing {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.gpus.is_none()
    }

    pub fn fill_from(&mut self, other: &Computing) {
        self.cpus = self.cpus.or(other.cpus);
        self.gpus = self.gpus.or(other.gpus);
    }
}

/// Client-editable content of a task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBody {
    /// Institution short name
    pub institution: String,
    pub fiscal_year: i32,
    #[serde(default)]
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbs_l2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbs_l3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_of_funds: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Headcounts::is_empty")]
    pub headcounts: Headcounts,
    #[serde(default, skip_serializing_if = "Computing::is_empty")]
    pub computing: Computing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordBody {
    /// Minimal task body for an institution and fiscal year
    pub fn task(institution: &str, fiscal_year: i32) -> Self {
        Self {
            institution: institution.to_string(),
            fiscal_year,
            kind: RecordKind::Task,
            labor_category: None,
            wbs_l2: None,
            wbs_l3: None,
            names: None,
            description: None,
            source_of_funds: None,
            fte: None,
            amount: None,
            headcounts: Headcounts::default(),
            computing: Computing::default(),
            notes: None,
        }
    }

    /// Check the body against the current schema
    ///
    /// Returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.institution.trim().is_empty() {
            return Err("institution is required".into());
        }
        if !FISCAL_YEAR_RANGE.contains(&self.fiscal_year) {
            return Err(format!("fiscal year {} out of range", self.fiscal_year));
        }
        for (name, value) in [("fte", self.fte), ("amount", self.amount)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} must be a non-negative number, got {}", name, v));
                }
            }
        }
        if self.kind == RecordKind::Task && self.fte.is_none() && self.amount.is_none() {
            return Err("a task needs an FTE or an amount".into());
        }
        if let Some(ref cat) = self.labor_category {
            if !LABOR_CATEGORIES.contains(&cat.as_str()) {
                return Err(format!("unknown labor category '{}'", cat));
            }
        }
        Ok(())
    }
}

/// One row of a MoU collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub row_id: RowId,
    #[serde(flatten)]
    pub body: RecordBody,
    #[serde(default)]
    pub marker: Marker,
    #[serde(default)]
    pub deleted: bool,
}

impl TaskRecord {
    pub fn new(row_id: RowId, body: RecordBody, marker: Marker) -> Self {
        Self {
            row_id,
            body,
            marker,
            deleted: false,
        }
    }

    pub fn institution(&self) -> &str {
        &self.body.institution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_next_bumps_revision() {
        let m0 = Marker::origin();
        let now = Utc::now();
        let m1 = m0.next("alice", now).unwrap();
        let m2 = m1.next("alice", now).unwrap();

        assert_eq!(m1.revision, 1);
        assert_ne!(m1, m2);
        assert_eq!(m2.actor, "alice");
    }

    #[test]
    fn test_marker_next_refuses_overflow() {
        let mut last = Marker::origin();
        last.revision = u64::MAX;
        let err = last.next("alice", Utc::now()).unwrap_err();
        assert!(matches!(err, MouError::Validation(_)));
    }

    #[test]
    fn test_validate_requires_quantity_for_tasks() {
        let body = RecordBody::task("UW-Madison", 2023);
        assert!(body.validate().is_err());

        let mut summary = body.clone();
        summary.kind = RecordKind::InstitutionSummary;
        assert!(summary.validate().is_ok());

        let mut task = body;
        task.amount = Some(5.0);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_and_unknown_labor() {
        let mut body = RecordBody::task("UW-Madison", 2023);
        body.fte = Some(-1.0);
        assert!(body.validate().is_err());

        body.fte = Some(0.5);
        body.labor_category = Some("ZZ".into());
        assert!(body.validate().is_err());

        body.labor_category = Some("SC".into());
        assert!(body.validate().is_ok());
    }

    #[test]
    fn test_record_json_is_flat() {
        let mut body = RecordBody::task("UW-Madison", 2023);
        body.fte = Some(1.5);
        let record = TaskRecord::new(RowId::from("r1"), body, Marker::origin());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["row_id"], "r1");
        assert_eq!(json["institution"], "UW-Madison");
        assert_eq!(json["fte"], 1.5);
        assert!(json.get("headcounts").is_none());

        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_summary_row_id_is_deterministic() {
        assert_eq!(
            RowId::summary("UW-Madison", 2023),
            RowId::summary("UW-Madison", 2023)
        );
        assert_eq!(RowId::summary("UW-Madison", 2023).as_str(), "summary:UW-Madison:2023");
    }
}
