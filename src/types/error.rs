//! Error types for the MoU REST server
//!
//! Layers with their own failure vocabulary (migration, directory) convert
//! into [`MouError`], which the HTTP layer maps onto status codes.

use hyper::StatusCode;

use crate::types::RowId;

/// Main error type for MoU operations
#[derive(Debug, thiserror::Error)]
pub enum MouError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Schema incompatible in collection '{collection}' row '{row}': {reason}")]
    SchemaIncompatible {
        collection: String,
        row: String,
        reason: String,
    },

    #[error("Conflict on {} row(s): {}", .0.len(), join_ids(.0))]
    Conflict(Vec<RowId>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_ids(ids: &[RowId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl MouError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SchemaIncompatible { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MalformedSnapshot(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DirectoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error code used in JSON bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::SchemaIncompatible { .. } => "SCHEMA_INCOMPATIBLE",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MalformedSnapshot(_) => "MALFORMED_SNAPSHOT",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DirectoryUnavailable(_) => "DIRECTORY_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::DirectoryUnavailable(_)
        )
    }

    /// JSON body for HTTP error responses
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        match self {
            Self::Conflict(ids) => {
                body["row_ids"] = serde_json::json!(ids);
            }
            Self::SchemaIncompatible {
                collection, row, ..
            } => {
                body["collection"] = serde_json::json!(collection);
                body["row"] = serde_json::json!(row);
            }
            _ => {}
        }
        body
    }
}

impl From<std::io::Error> for MouError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for MouError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for MouError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for MouError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for MouError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthenticated(format!("JWT error: {}", err))
    }
}

/// Result type alias for MoU operations
pub type Result<T> = std::result::Result<T, MouError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            MouError::StoreUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            MouError::Conflict(vec![RowId::from("r1")]).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MouError::Unauthorized("nope".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MouError::SchemaIncompatible {
                collection: "100".into(),
                row: "r1".into(),
                reason: "missing fiscal year".into(),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_conflict_body_lists_rows() {
        let err = MouError::Conflict(vec![RowId::from("r1"), RowId::from("r2")]);
        assert_eq!(err.to_string(), "Conflict on 2 row(s): r1, r2");

        let body = err.to_json();
        assert_eq!(body["error"], "CONFLICT");
        assert_eq!(body["row_ids"], serde_json::json!(["r1", "r2"]));
        assert_eq!(body["retryable"], false);
    }

    #[test]
    fn test_retryable() {
        assert!(MouError::StoreUnavailable("x".into()).is_retryable());
        assert!(!MouError::Validation("x".into()).is_retryable());
    }
}
