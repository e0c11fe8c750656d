//! Institution directory
//!
//! The directory service itself is external. This module provides:
//! - [`RemoteDirectory`]: HTTP client for the live service
//! - [`StaticDirectory`]: injected institution list (override file, tests)
//! - [`CachedDirectory`]: bounded-age snapshot in front of either one
//!
//! Institutions are immutable for the duration of a request.

mod cache;
mod remote;
mod static_dir;

pub use cache::{spawn_refresh_task, CachedDirectory};
pub use remote::RemoteDirectory;
pub use static_dir::{parse_directory_json, StaticDirectory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::MouError;

/// Whether an entry is a full institution or a grouped sub-entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstitutionKind {
    #[default]
    Full,
    PhdAuthor,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    /// Identifier used on task records
    pub short_name: String,
    pub long_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub is_us: bool,
    #[serde(default)]
    pub has_mou: bool,
    #[serde(default)]
    pub kind: InstitutionKind,
    /// Group tying sub-institutions together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Institution {
    pub fn new(short_name: &str, long_name: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            long_name: long_name.to_string(),
            abbreviation: None,
            is_us: false,
            has_mou: true,
            kind: InstitutionKind::Full,
            group: None,
        }
    }

    /// Whether a spreadsheet or API value names this institution
    pub fn matches_name(&self, value: &str) -> bool {
        let value = value.trim();
        self.short_name.eq_ignore_ascii_case(value)
            || self.long_name.eq_ignore_ascii_case(value)
            || self
                .abbreviation
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(value))
    }

    /// Whether an identity affiliation grants access to this institution
    pub fn matches_affiliation(&self, affiliation: &str) -> bool {
        let affiliation = affiliation.trim();
        self.short_name.eq_ignore_ascii_case(affiliation)
            || self
                .abbreviation
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(affiliation))
            || self
                .group
                .as_deref()
                .is_some_and(|g| g.eq_ignore_ascii_case(affiliation))
    }
}

/// Directory lookup errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("institution '{0}' not found")]
    NotFound(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("directory data malformed: {0}")]
    Malformed(String),
}

impl From<DirectoryError> for MouError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(name) => {
                MouError::NotFound(format!("institution '{}'", name))
            }
            DirectoryError::Unavailable(msg) => MouError::DirectoryUnavailable(msg),
            DirectoryError::Malformed(msg) => MouError::BadRequest(msg),
        }
    }
}

/// Source of institution entries
#[async_trait]
pub trait InstitutionDirectory: Send + Sync {
    /// Every known institution
    async fn list(&self) -> Result<Vec<Institution>, DirectoryError>;

    /// Resolve an identifier or display name to one institution
    async fn resolve(&self, name: &str) -> Result<Institution, DirectoryError> {
        self.list()
            .await?
            .into_iter()
            .find(|inst| inst.matches_name(name))
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// Every institution any of `affiliations` maps to
    ///
    /// A group affiliation can match several grouped sub-institutions.
    async fn matching(&self, affiliations: &[String]) -> Result<Vec<Institution>, DirectoryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|inst| affiliations.iter().any(|aff| inst.matches_affiliation(aff)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_name_and_affiliation() {
        let mut inst = Institution::new("UW-Madison", "University of Wisconsin-Madison");
        inst.abbreviation = Some("UW".into());
        inst.group = Some("Wisconsin".into());

        assert!(inst.matches_name("uw-madison"));
        assert!(inst.matches_name("University of Wisconsin-Madison"));
        assert!(inst.matches_name(" UW "));
        assert!(!inst.matches_name("Wisconsin"));

        assert!(inst.matches_affiliation("Wisconsin"));
        assert!(inst.matches_affiliation("UW"));
        assert!(!inst.matches_affiliation("University of Wisconsin-Madison"));
    }

    #[test]
    fn test_error_mapping() {
        let err: MouError = DirectoryError::Unavailable("timeout".into()).into();
        assert!(matches!(err, MouError::DirectoryUnavailable(_)));

        let err: MouError = DirectoryError::NotFound("Nowhere".into()).into();
        assert!(matches!(err, MouError::NotFound(_)));
    }
}
