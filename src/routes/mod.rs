//! HTTP routes for the MoU REST server
//!
//! Handlers are generic over the request body so they run unchanged on
//! hyper's `Incoming` and on in-memory bodies.

pub mod confirmation;
pub mod health;
pub mod institution;
pub mod snapshots;
pub mod table;

pub use confirmation::{
    handle_confirm_values, handle_make_touchstone, handle_read_confirmation,
    handle_read_touchstone,
};
pub use health::health_check;
pub use institution::{handle_institutions, handle_scope};
pub use snapshots::{handle_list_snapshots, handle_make_snapshot};
pub use table::{
    handle_export_dump, handle_ingest_dump, handle_ingest_xlsx, handle_read_table,
    handle_submit_edits, handle_table_config,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::auth::{extract_token_from_header, get_required_role, is_operation_allowed, Identity};
use crate::server::AppState;
use crate::types::MouError;

pub type FullBody = Full<Bytes>;

// =============================================================================
// Response Helpers
// =============================================================================

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"INTERNAL_ERROR","message":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

pub(crate) fn error_response(err: &MouError) -> Response<FullBody> {
    let status = err.status_code();
    if status.is_server_error() {
        warn!(code = err.code(), "Request failed: {}", err);
    } else {
        debug!(code = err.code(), "Request refused: {}", err);
    }
    json_response(status, &err.to_json())
}

/// Collapse a handler result into a response
pub(crate) fn respond(result: Result<Response<FullBody>, MouError>) -> Response<FullBody> {
    result.unwrap_or_else(|err| error_response(&err))
}

// =============================================================================
// Request Helpers
// =============================================================================

pub(crate) async fn read_json<T, B>(req: Request<B>) -> Result<T, MouError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| MouError::BadRequest(format!("Invalid body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| MouError::BadRequest(format!("Invalid JSON: {}", e)))
}

/// Decoded query string parameters
pub(crate) fn query_params(uri: &Uri) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(q) = uri.query() {
        for pair in q.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                continue;
            }
            let value = urlencoding::decode(value).unwrap_or_default();
            params.insert(key.to_string(), value.into_owned());
        }
    }
    params
}

pub(crate) fn flag(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

// =============================================================================
// Auth Helpers
// =============================================================================

/// Identity of the caller from the bearer token
///
/// In dev mode a request without a token acts as an admin.
pub(crate) fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Identity, MouError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let Some(token) = extract_token_from_header(header) else {
        if state.args.dev_mode {
            warn!("No bearer token, acting as dev admin");
            return Ok(Identity::dev_admin());
        }
        return Err(MouError::Unauthenticated("missing bearer token".into()));
    };

    let result = state.jwt.verify_token(token);
    match result.claims {
        Some(claims) if result.valid => Ok(claims.into_identity(&state.args.auth_prefix)),
        _ => Err(MouError::Unauthenticated(
            result.error.unwrap_or_else(|| "invalid token".into()),
        )),
    }
}

/// Require the role an operation is whitelisted for
pub(crate) fn require(identity: &Identity, operation: &str) -> Result<(), MouError> {
    if is_operation_allowed(operation, identity.role) {
        return Ok(());
    }
    let needed = get_required_role(operation)
        .map(|r| r.to_string())
        .unwrap_or_else(|| "unknown".into());
    Err(MouError::Unauthorized(format!(
        "'{}' requires the {} role",
        operation, needed
    )))
}

/// Reject MoUs this instance does not serve
pub(crate) fn check_mou(state: &AppState, mou: &str) -> Result<(), MouError> {
    if state.args.is_known_mou(mou) {
        Ok(())
    } else {
        Err(MouError::NotFound(format!("unknown MoU '{}'", mou)))
    }
}
