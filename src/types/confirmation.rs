//! Institution value confirmations
//!
//! PIs periodically confirm that an institution's headcounts, table rows
//! and computing values are current. A confirmation holds until that part
//! is edited again or an admin moves the MoU-wide touchstone past it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Which parts of an institution's values an action covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueParts {
    #[serde(default)]
    pub headcounts: bool,
    #[serde(default)]
    pub table: bool,
    #[serde(default)]
    pub computing: bool,
}

impl ValueParts {
    pub fn any(self) -> bool {
        self.headcounts || self.table || self.computing
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            headcounts: self.headcounts || other.headcounts,
            table: self.table || other.table,
            computing: self.computing || other.computing,
        }
    }
}

/// Edit and confirmation times of one part
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartMetadata {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_edit: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl PartMetadata {
    /// Confirmed no earlier than the last edit and the touchstone
    ///
    /// A part never edited, under no touchstone, counts as confirmed.
    pub fn is_confirmed(&self, touchstone: Option<DateTime<Utc>>) -> bool {
        match self.confirmed_at {
            Some(at) => {
                self.last_edit.map_or(true, |edit| at >= edit)
                    && touchstone.map_or(true, |t| at >= t)
            }
            None => self.last_edit.is_none() && touchstone.is_none(),
        }
    }
}

/// Confirmation record of one institution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstitutionConfirmation {
    pub institution: String,
    #[serde(default)]
    pub headcounts: PartMetadata,
    #[serde(default)]
    pub table: PartMetadata,
    #[serde(default)]
    pub computing: PartMetadata,
}

impl InstitutionConfirmation {
    fn new(institution: &str) -> Self {
        Self {
            institution: institution.to_string(),
            ..Self::default()
        }
    }

    fn parts_mut(&mut self, parts: ValueParts) -> Vec<&mut PartMetadata> {
        let mut selected = Vec::new();
        if parts.headcounts {
            selected.push(&mut self.headcounts);
        }
        if parts.table {
            selected.push(&mut self.table);
        }
        if parts.computing {
            selected.push(&mut self.computing);
        }
        selected
    }
}

/// An edit to some of an institution's values
#[derive(Debug, Clone, PartialEq)]
pub struct InstitutionEdit {
    pub institution: String,
    pub parts: ValueParts,
    pub at: DateTime<Utc>,
}

/// Confirmation state of a MoU
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationState {
    /// Confirmations older than this are stale for every institution
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub touchstone: Option<DateTime<Utc>>,
    #[serde(default)]
    pub institutions: Vec<InstitutionConfirmation>,
}

/// Confirmation view returned to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationStatus {
    #[serde(flatten)]
    pub record: InstitutionConfirmation,
    pub headcounts_confirmed: bool,
    pub table_confirmed: bool,
    pub computing_confirmed: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub touchstone: Option<DateTime<Utc>>,
}

impl ConfirmationState {
    fn entry(&mut self, institution: &str) -> &mut InstitutionConfirmation {
        let index = match self
            .institutions
            .iter()
            .position(|c| c.institution == institution)
        {
            Some(index) => index,
            None => {
                self.institutions.push(InstitutionConfirmation::new(institution));
                self.institutions.len() - 1
            }
        };
        &mut self.institutions[index]
    }

    pub fn confirm(&mut self, institution: &str, parts: ValueParts, at: DateTime<Utc>) {
        let at = at.trunc_subsecs(3);
        for part in self.entry(institution).parts_mut(parts) {
            part.confirmed_at = Some(at);
        }
    }

    pub fn note_edit(&mut self, edit: &InstitutionEdit) {
        let at = edit.at.trunc_subsecs(3);
        for part in self.entry(&edit.institution).parts_mut(edit.parts) {
            part.last_edit = Some(at);
        }
    }

    pub fn retouchstone(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = at.trunc_subsecs(3);
        self.touchstone = Some(at);
        at
    }

    pub fn status(&self, institution: &str) -> ConfirmationStatus {
        let record = self
            .institutions
            .iter()
            .find(|c| c.institution == institution)
            .cloned()
            .unwrap_or_else(|| InstitutionConfirmation::new(institution));
        ConfirmationStatus {
            headcounts_confirmed: record.headcounts.is_confirmed(self.touchstone),
            table_confirmed: record.table.is_confirmed(self.touchstone),
            computing_confirmed: record.computing.is_confirmed(self.touchstone),
            touchstone: self.touchstone,
            record,
        }
    }
}
