//! Institution directory and caller scope routes

use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{authenticate, json_response, require, respond, FullBody};
use crate::auth::{MutationScope, Role};
use crate::directory::Institution;
use crate::server::AppState;
use crate::types::MouError;

#[derive(Debug, Serialize)]
pub struct InstitutionList {
    pub institutions: Vec<Institution>,
}

#[derive(Debug, Serialize)]
pub struct ScopeResponse {
    pub subject: String,
    pub role: Option<Role>,
    pub affiliations: BTreeSet<String>,
    pub scope: MutationScope,
}

/// GET /institution/today
pub async fn handle_institutions<B>(req: Request<B>, state: Arc<AppState>) -> Response<FullBody> {
    respond(institutions(req, &state).await)
}

async fn institutions<B>(req: Request<B>, state: &AppState) -> Result<Response<FullBody>, MouError> {
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "read_institutions")?;

    let mut institutions = state.directory.list().await?;
    institutions.sort_by(|a, b| a.short_name.cmp(&b.short_name));
    Ok(json_response(StatusCode::OK, &InstitutionList { institutions }))
}

/// GET /scope
pub async fn handle_scope<B>(req: Request<B>, state: Arc<AppState>) -> Response<FullBody> {
    respond(scope(req, &state).await)
}

async fn scope<B>(req: Request<B>, state: &AppState) -> Result<Response<FullBody>, MouError> {
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "read_scope")?;

    let scope = state.gate.scope_for(&identity).await;
    Ok(json_response(
        StatusCode::OK,
        &ScopeResponse {
            subject: identity.subject,
            role: identity.role,
            affiliations: identity.affiliations,
            scope,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{body_json, request, state, token};
    use serde_json::json;

    #[tokio::test]
    async fn test_institution_listing() {
        let state = state();
        let reader = token(&state, "dave", &[], "read");
        let response =
            handle_institutions(request("GET", "/institution/today", Some(&reader), None), state).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["institutions"][0]["short_name"], "InstA");
        assert_eq!(body["institutions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scope_of_pi() {
        let state = state();
        let pi = token(&state, "alice", &["InstB"], "write");
        let response = handle_scope(request("GET", "/scope", Some(&pi), None), state).await;

        let body = body_json(response).await;
        assert_eq!(body["role"], "write");
        assert_eq!(
            body["scope"],
            json!({"scope": "write_own_institution", "institutions": ["InstB"]})
        );
    }
}
