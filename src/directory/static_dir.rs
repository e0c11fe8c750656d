//! Static institution directory
//!
//! Accepts the flat directory format keyed by short name:
//!
//! ```json
//! {"UW-Madison": {"name": "University of Wisconsin-Madison", "is_US": "true",
//!                 "has_mou": "true", "abbreviation": "UW"}}
//! ```
//!
//! or a plain array of [`Institution`] objects.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::{DirectoryError, Institution, InstitutionDirectory, InstitutionKind};

#[derive(Deserialize)]
struct FlatEntry {
    #[serde(alias = "long_name")]
    name: String,
    #[serde(default, rename = "is_US", alias = "is_us", deserialize_with = "flag")]
    is_us: bool,
    #[serde(default = "default_true", deserialize_with = "flag")]
    has_mou: bool,
    #[serde(default)]
    abbreviation: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default, alias = "institution_type")]
    kind: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Booleans arrive both as JSON booleans and as "true"/"false" strings
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => Ok(s.trim().eq_ignore_ascii_case("true")),
    }
}

fn kind_from(value: Option<&str>) -> InstitutionKind {
    match value.map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "phd_author" || v == "phd-author" => InstitutionKind::PhdAuthor,
        _ => InstitutionKind::Full,
    }
}

/// Parse directory JSON in either accepted shape
pub fn parse_directory_json(json: &str) -> Result<Vec<Institution>, DirectoryError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| DirectoryError::Malformed(e.to_string()))?;

    if value.is_array() {
        return serde_json::from_value(value).map_err(|e| DirectoryError::Malformed(e.to_string()));
    }

    let flat: BTreeMap<String, FlatEntry> =
        serde_json::from_value(value).map_err(|e| DirectoryError::Malformed(e.to_string()))?;

    Ok(flat
        .into_iter()
        .map(|(short_name, entry)| Institution {
            short_name,
            long_name: entry.name,
            abbreviation: entry.abbreviation,
            is_us: entry.is_us,
            has_mou: entry.has_mou,
            kind: kind_from(entry.kind.as_deref()),
            group: entry.group,
        })
        .collect())
}

/// Directory backed by a fixed institution list
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    institutions: Vec<Institution>,
}

impl StaticDirectory {
    pub fn new(institutions: Vec<Institution>) -> Self {
        Self { institutions }
    }

    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        Ok(Self::new(parse_directory_json(json)?))
    }

    /// Load an override file
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DirectoryError::Unavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        let directory = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            institutions = directory.institutions.len(),
            "Loaded institution directory override"
        );
        Ok(directory)
    }
}

#[async_trait]
impl InstitutionDirectory for StaticDirectory {
    async fn list(&self) -> Result<Vec<Institution>, DirectoryError> {
        Ok(self.institutions.clone())
    }
}
