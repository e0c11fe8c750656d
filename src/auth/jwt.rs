//! JWT bearer token handling
//!
//! Tokens are issued by the external identity provider; this side only
//! verifies them and turns the claim set into an [`Identity`].
//!
//! Security notes:
//! - Tokens are verified with an HMAC secret (HS512 by default)
//! - The issuer is checked when one is configured
//! - In production, MOU_AUTH_SECRET should be a strong random value

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::{Identity, Role};
use crate::types::MouError;

/// Group path prefix carrying institution affiliations
pub const INSTITUTION_GROUP_PREFIX: &str = "/institutions/";

/// Group granting admin regardless of role claims
pub const ADMIN_GROUP: &str = "/posix/mou-dashboard-admin";

/// Payload carried in the JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Group paths, e.g. `/institutions/IceCube/UW-Madison`
    #[serde(default)]
    pub groups: Vec<String>,
    /// Prefixed role claims, e.g. `mou:write`
    #[serde(default)]
    pub roles: Vec<String>,
    /// Space-separated scope string, also searched for role claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    /// Highest role found in `roles` and `scope`, or via the admin group
    pub fn role(&self, prefix: &str) -> Option<Role> {
        if self.groups.iter().any(|g| g == ADMIN_GROUP) {
            return Some(Role::Admin);
        }
        let scoped = self
            .scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace();
        self.roles
            .iter()
            .map(String::as_str)
            .chain(scoped)
            .filter_map(|claim| Role::from_claim(claim, prefix))
            .max()
    }

    /// Institution affiliations from group paths
    ///
    /// `/institutions/<experiment>/<institution>` yields `<institution>`;
    /// the same institution under several experiments collapses to one.
    pub fn affiliations(&self) -> BTreeSet<String> {
        self.groups
            .iter()
            .filter_map(|g| g.strip_prefix(INSTITUTION_GROUP_PREFIX))
            .filter_map(|rest| rest.rsplit('/').next())
            .filter(|inst| !inst.is_empty())
            .map(|inst| inst.to_string())
            .collect()
    }

    /// Build the identity consumed by the authorization gate
    pub fn into_identity(self, prefix: &str) -> Identity {
        let role = self.role(prefix);
        let affiliations = self.affiliations();
        Identity {
            subject: self.preferred_username.unwrap_or(self.sub),
            affiliations,
            role,
        }
    }
}

/// Result of token validation
#[derive(Debug)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

impl TokenValidationResult {
    pub fn valid(claims: Claims) -> Self {
        Self {
            valid: true,
            claims: Some(claims),
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            claims: None,
            error: Some(error.into()),
        }
    }
}

/// JWT validator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    issuer: Option<String>,
    algorithm: Algorithm,
}

impl JwtValidator {
    /// Create a new JWT validator
    ///
    /// Returns an error if the secret is empty or too short, or the
    /// algorithm is not an HMAC one
    pub fn new(secret: String, issuer: Option<String>, algorithm: &str) -> Result<Self, MouError> {
        if secret.is_empty() {
            return Err(MouError::Config(
                "MOU_AUTH_SECRET is required in production mode".into(),
            ));
        }

        if secret.len() < 32 {
            return Err(MouError::Config(
                "MOU_AUTH_SECRET must be at least 32 characters".into(),
            ));
        }

        let algorithm = match algorithm {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(MouError::Config(format!(
                    "unsupported auth algorithm '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            secret,
            issuer,
            algorithm,
        })
    }

    /// Create a validator for dev mode
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            issuer: None,
            algorithm: Algorithm::HS512,
        }
    }

    /// Sign a claim set (dev tooling and tests)
    pub fn generate_token(&self, mut claims: Claims) -> Result<String, MouError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| MouError::Internal(format!("System time error: {}", e)))?
            .as_secs();
        if claims.iat == 0 {
            claims.iat = now;
        }
        if claims.iss.is_none() {
            claims.iss = self.issuer.clone();
        }

        encode(
            &Header::new(self.algorithm),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| MouError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Verify and decode a JWT token
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        let mut validation = Validation::new(self.algorithm);
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }

        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        ) {
            Ok(token_data) => TokenValidationResult::valid(token_data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let error_msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    ErrorKind::InvalidIssuer => "Invalid issuer",
                    _ => "Token validation failed",
                };
                TokenValidationResult::invalid(error_msg)
            }
        }
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

#[cfg(test)]
pub(crate) fn test_claims(sub: &str, groups: &[&str], roles: &[&str]) -> Claims {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Claims {
        sub: sub.to_string(),
        preferred_username: None,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        scope: None,
        iss: None,
        iat: now,
        exp: now + 3600,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validator() -> JwtValidator {
        JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            Some("https://keycloak.example/auth/realms/IceCube".into()),
            "HS512",
        )
        .unwrap()
    }

    #[test]
    fn test_generate_and_verify_token() {
        let validator = test_validator();
        let claims = test_claims(
            "alice",
            &["/institutions/IceCube/UW-Madison"],
            &["mou:write"],
        );

        let token = validator.generate_token(claims).unwrap();
        let result = validator.verify_token(&token);
        assert!(result.valid);

        let identity = result.claims.unwrap().into_identity("mou");
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, Some(Role::Write));
        assert!(identity.affiliations.contains("UW-Madison"));
    }

    #[test]
    fn test_wrong_secret_and_issuer() {
        let validator = test_validator();
        let other = JwtValidator::new(
            "different-secret-that-is-at-least-32-characters".into(),
            None,
            "HS512",
        )
        .unwrap();

        let token = other
            .generate_token(test_claims("bob", &[], &["mou:read"]))
            .unwrap();
        assert!(!validator.verify_token(&token).valid);

        let mut claims = test_claims("bob", &[], &["mou:read"]);
        claims.iss = Some("https://elsewhere.example".into());
        let token = JwtValidator::new(
            "test-secret-that-is-at-least-32-characters-long".into(),
            None,
            "HS512",
        )
        .unwrap()
        .generate_token(claims)
        .unwrap();
        let result = validator.verify_token(&token);
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("Invalid issuer"));
    }

    #[test]
    fn test_affiliations_deduplicate_across_experiments() {
        let claims = test_claims(
            "carol",
            &[
                "/institutions/IceCube/DESY",
                "/institutions/IceCube-Gen2/DESY",
                "/institutions/IceCube/Aachen",
                "/tokens/something",
            ],
            &[],
        );
        let affiliations: Vec<String> = claims.affiliations().into_iter().collect();
        assert_eq!(affiliations, vec!["Aachen".to_string(), "DESY".to_string()]);
    }

    #[test]
    fn test_role_resolution() {
        let mut claims = test_claims("dave", &[], &["mou:read", "mou:write"]);
        assert_eq!(claims.role("mou"), Some(Role::Write));

        claims.roles.clear();
        claims.scope = Some("openid mou:admin".into());
        assert_eq!(claims.role("mou"), Some(Role::Admin));

        let admin = test_claims("erin", &[ADMIN_GROUP], &[]);
        assert_eq!(admin.role("mou"), Some(Role::Admin));

        let nobody = test_claims("frank", &[], &["other:admin"]);
        assert_eq!(nobody.role("mou"), None);
    }

    #[test]
    fn test_extract_token_from_header() {
        assert_eq!(
            extract_token_from_header(Some("Bearer abc123")),
            Some("abc123")
        );
        assert_eq!(extract_token_from_header(Some("abc123")), Some("abc123"));
        assert_eq!(extract_token_from_header(None), None);
        assert_eq!(extract_token_from_header(Some("Bearer ")), None);
        assert_eq!(extract_token_from_header(Some("Basic abc123")), None);
    }

    #[test]
    fn test_secret_and_algorithm_validation() {
        assert!(JwtValidator::new("short".into(), None, "HS512").is_err());
        assert!(JwtValidator::new("".into(), None, "HS512").is_err());
        assert!(JwtValidator::new(
            "this-secret-is-at-least-32-chars-long".into(),
            None,
            "RS256"
        )
        .is_err());
        assert!(JwtValidator::new(
            "this-secret-is-at-least-32-chars-long".into(),
            None,
            "HS256"
        )
        .is_ok());
    }
}
