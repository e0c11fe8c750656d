//! Institution value confirmation routes
//!
//! - `GET  /institution/values/confirmation/{mou}?institution=X`: confirmation status
//! - `POST /institution/values/confirmation/{mou}`: confirm parts of an institution's values
//! - `GET  /institution/values/confirmation/touchstone/{mou}`: current touchstone (admin)
//! - `POST /institution/values/confirmation/touchstone/{mou}`: move the touchstone to now (admin)

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{authenticate, check_mou, json_response, query_params, read_json, require, respond, FullBody};
use crate::directory::DirectoryError;
use crate::server::AppState;
use crate::types::{MouError, ValueParts};

/// Body of a confirmation
#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub institution: String,
    #[serde(flatten)]
    pub parts: ValueParts,
}

#[derive(Debug, Serialize)]
pub struct TouchstoneResponse {
    pub mou: String,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub touchstone: Option<DateTime<Utc>>,
}

async fn short_name(state: &AppState, institution: &str) -> Result<String, MouError> {
    match state.directory.resolve(institution).await {
        Ok(inst) => Ok(inst.short_name),
        Err(DirectoryError::NotFound(name)) => {
            Err(MouError::Validation(format!("unknown institution '{}'", name)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn handle_read_confirmation<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(read_confirmation(req, &state, mou).await)
}

async fn read_confirmation<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "read_confirmation")?;

    let params = query_params(req.uri());
    let institution = params
        .get("institution")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MouError::BadRequest("institution is required".into()))?;
    let institution = short_name(state, institution).await?;

    let confirmations = state.store.load_confirmations(mou).await?;
    Ok(json_response(StatusCode::OK, &confirmations.status(&institution)))
}

pub async fn handle_confirm_values<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    respond(confirm_values(req, &state, mou).await)
}

async fn confirm_values<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "confirm_values")?;

    let body: ConfirmRequest = read_json(req).await?;
    if !body.parts.any() {
        return Err(MouError::BadRequest("nothing to confirm".into()));
    }
    let institution = short_name(state, &body.institution).await?;

    let scope = state.gate.scope_for(&identity).await;
    if !scope.permits_write(&institution) {
        return Err(MouError::Unauthorized(format!(
            "cannot confirm values of '{}'",
            institution
        )));
    }

    let now = Utc::now();
    let parts = body.parts;
    let confirmations = state
        .store
        .update_confirmations(mou, &|s| s.confirm(&institution, parts, now))
        .await?;

    info!(mou = %mou, institution = %institution, subject = %identity.subject, "Values confirmed");
    state
        .audit
        .log_confirmation(
            mou,
            &identity.subject,
            &institution,
            serde_json::to_value(parts).unwrap_or_default(),
        )
        .await;

    Ok(json_response(StatusCode::OK, &confirmations.status(&institution)))
}

pub async fn handle_read_touchstone<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(read_touchstone(req, &state, mou).await)
}

async fn read_touchstone<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "touchstone")?;

    let confirmations = state.store.load_confirmations(mou).await?;
    Ok(json_response(
        StatusCode::OK,
        &TouchstoneResponse {
            mou: mou.to_string(),
            touchstone: confirmations.touchstone,
        },
    ))
}

pub async fn handle_make_touchstone<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(make_touchstone(req, &state, mou).await)
}

async fn make_touchstone<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "touchstone")?;

    let now = Utc::now();
    let confirmations = state
        .store
        .update_confirmations(mou, &|s| {
            s.retouchstone(now);
        })
        .await?;

    if let Some(at) = confirmations.touchstone {
        info!(mou = %mou, subject = %identity.subject, "Touchstone moved to {}", at);
        state.audit.log_touchstone(mou, &identity.subject, at).await;
    }

    Ok(json_response(
        StatusCode::OK,
        &TouchstoneResponse {
            mou: mou.to_string(),
            touchstone: confirmations.touchstone,
        },
    ))
}
