//! Authorization Gate
//!
//! Maps an authenticated identity to a mutation scope. Institution
//! affiliations are resolved through the directory at request time; any
//! directory failure degrades the scope to read-only.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::Role;
use crate::directory::InstitutionDirectory;

/// Verified caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub subject: String,
    /// Institution names or group names from the identity provider
    pub affiliations: BTreeSet<String>,
    pub role: Option<Role>,
}

impl Identity {
    pub fn new(subject: &str, affiliations: &[&str], role: Option<Role>) -> Self {
        Self {
            subject: subject.to_string(),
            affiliations: affiliations.iter().map(|a| a.to_string()).collect(),
            role,
        }
    }

    /// Local admin used for token-less requests in dev mode
    pub fn dev_admin() -> Self {
        Self::new("dev-admin", &[], Some(Role::Admin))
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(Role::Admin)
    }
}

/// What an identity may change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "institutions", rename_all = "snake_case")]
pub enum MutationScope {
    NoAccess,
    ReadOnly,
    /// Institution short names the identity may write
    WriteOwnInstitution(BTreeSet<String>),
    WriteAll,
}

impl MutationScope {
    pub fn can_read(&self) -> bool {
        !matches!(self, Self::NoAccess)
    }

    /// Whether a record of `institution` may be written
    pub fn permits_write(&self, institution: &str) -> bool {
        match self {
            Self::WriteAll => true,
            Self::WriteOwnInstitution(set) => {
                set.iter().any(|i| i.eq_ignore_ascii_case(institution))
            }
            Self::NoAccess | Self::ReadOnly => false,
        }
    }

    pub fn is_write_all(&self) -> bool {
        matches!(self, Self::WriteAll)
    }
}

/// Resolves identities to mutation scopes
#[derive(Clone)]
pub struct AuthorizationGate {
    directory: Arc<dyn InstitutionDirectory>,
}

impl AuthorizationGate {
    pub fn new(directory: Arc<dyn InstitutionDirectory>) -> Self {
        Self { directory }
    }

    /// Compute the mutation scope of an identity
    ///
    /// A PI is granted the union of every directory entry matching any of
    /// their affiliations, so a group affiliation covers all of its
    /// sub-institutions.
    pub async fn scope_for(&self, identity: &Identity) -> MutationScope {
        let role = match identity.role {
            None => return MutationScope::NoAccess,
            Some(Role::Admin) => return MutationScope::WriteAll,
            Some(Role::Read) => return MutationScope::ReadOnly,
            Some(role) => role,
        };

        let affiliations: Vec<String> = identity.affiliations.iter().cloned().collect();
        let writable: BTreeSet<String> = match self.directory.matching(&affiliations).await {
            Ok(matched) => matched.into_iter().map(|inst| inst.short_name).collect(),
            Err(e) => {
                warn!(
                    subject = %identity.subject,
                    error = %e,
                    "Directory lookup failed, granting read-only"
                );
                return MutationScope::ReadOnly;
            }
        };

        debug!(
            subject = %identity.subject,
            role = %role,
            writable = writable.len(),
            "Resolved mutation scope"
        );

        if writable.is_empty() {
            MutationScope::ReadOnly
        } else {
            MutationScope::WriteOwnInstitution(writable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, Institution, StaticDirectory};
    use async_trait::async_trait;

    struct Down;

    #[async_trait]
    impl InstitutionDirectory for Down {
        async fn list(&self) -> Result<Vec<Institution>, DirectoryError> {
            Err(DirectoryError::Unavailable("connection refused".into()))
        }
    }

    fn directory() -> Arc<dyn InstitutionDirectory> {
        let mut aachen = Institution::new("Aachen", "RWTH Aachen University");
        aachen.group = Some("Aachen-group".into());
        let mut aachen_phd = Institution::new("Aachen-phd", "RWTH Aachen PhD authors");
        aachen_phd.group = Some("Aachen-group".into());
        Arc::new(StaticDirectory::new(vec![
            Institution::new("InstA", "Institution A"),
            Institution::new("InstB", "Institution B"),
            aachen,
            aachen_phd,
        ]))
    }

    #[tokio::test]
    async fn test_pi_writes_only_own_institution() {
        let gate = AuthorizationGate::new(directory());
        let pi = Identity::new("alice", &["InstA"], Some(Role::Write));

        let scope = gate.scope_for(&pi).await;
        assert!(scope.permits_write("InstA"));
        assert!(!scope.permits_write("InstB"));

        let admin = Identity::new("root", &[], Some(Role::Admin));
        assert!(gate.scope_for(&admin).await.permits_write("InstB"));
    }

    #[tokio::test]
    async fn test_group_affiliation_is_union() {
        let gate = AuthorizationGate::new(directory());
        let pi = Identity::new("bob", &["Aachen-group"], Some(Role::Write));

        match gate.scope_for(&pi).await {
            MutationScope::WriteOwnInstitution(set) => {
                assert_eq!(set.len(), 2);
                assert!(set.contains("Aachen"));
                assert!(set.contains("Aachen-phd"));
            }
            other => panic!("unexpected scope {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directory_failure_fails_closed() {
        let gate = AuthorizationGate::new(Arc::new(Down));
        let pi = Identity::new("alice", &["InstA"], Some(Role::Write));
        assert_eq!(gate.scope_for(&pi).await, MutationScope::ReadOnly);

        // Admins do not depend on the directory
        let admin = Identity::new("root", &[], Some(Role::Admin));
        assert_eq!(gate.scope_for(&admin).await, MutationScope::WriteAll);
    }

    #[tokio::test]
    async fn test_unmatched_and_roleless() {
        let gate = AuthorizationGate::new(directory());

        let stranger = Identity::new("carol", &["Elsewhere"], Some(Role::Write));
        assert_eq!(gate.scope_for(&stranger).await, MutationScope::ReadOnly);

        let reader = Identity::new("dave", &["InstA"], Some(Role::Read));
        assert_eq!(gate.scope_for(&reader).await, MutationScope::ReadOnly);

        let anonymous = Identity::new("eve", &["InstA"], None);
        let scope = gate.scope_for(&anonymous).await;
        assert_eq!(scope, MutationScope::NoAccess);
        assert!(!scope.can_read());
    }

    #[test]
    fn test_scope_serialization() {
        let scope = MutationScope::WriteOwnInstitution(["InstA".to_string()].into());
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["scope"], "write_own_institution");
        assert_eq!(json["institutions"], serde_json::json!(["InstA"]));
    }
}
