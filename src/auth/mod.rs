//! Authentication and authorization
//!
//! Provides:
//! - JWT bearer token verification and claim decoding
//! - Role claims and the per-operation role whitelist
//! - The authorization gate mapping identities to mutation scopes

pub mod gate;
pub mod jwt;
pub mod permissions;

pub use gate::{AuthorizationGate, Identity, MutationScope};
pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenValidationResult};
pub use permissions::{get_required_role, is_operation_allowed, Role};
