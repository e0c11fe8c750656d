//! Roles and the operation whitelist for MoU routes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role claim granted by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Role {
    /// Read-only access to every institution
    Read = 0,
    /// Principal investigator: may write records of affiliated institutions
    Write = 1,
    /// May write every record, ingest snapshots and purge
    Admin = 2,
}

impl Role {
    /// Parse a prefixed role claim such as `mou:write`
    pub fn from_claim(claim: &str, prefix: &str) -> Option<Self> {
        let name = claim.strip_prefix(prefix)?.strip_prefix(':')?;
        match name {
            "read" => Some(Self::Read),
            "write" | "pi" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Read => write!(f, "read"),
            Role::Write => write!(f, "write"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Get the role an operation requires.
/// Returns None for unknown operations (which should be blocked).
pub fn get_required_role(operation: &str) -> Option<Role> {
    match operation {
        "read_table" | "list_snapshots" | "read_institutions" | "read_scope" | "read_config" => {
            Some(Role::Read)
        }

        "submit_edits" | "make_snapshot" | "read_confirmation" | "confirm_values" => {
            Some(Role::Write)
        }

        "ingest_xlsx" | "ingest_dump" | "admin_snapshots" | "touchstone" => Some(Role::Admin),

        _ => None,
    }
}

/// Check if an operation is allowed for the given role
pub fn is_operation_allowed(operation: &str, role: Option<Role>) -> bool {
    match (get_required_role(operation), role) {
        (Some(required), Some(role)) => role >= required,
        _ => false,
    }
}
