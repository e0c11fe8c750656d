//! Snapshot routes
//!
//! - `GET  /snapshots/list/{mou}?is_admin=`: historical collections, newest first
//! - `POST /snapshots/make/{mou}`: copy the live collection under a label

use bytes::Bytes;
use chrono::Utc;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    authenticate, check_mou, flag, json_response, query_params, read_json, require, respond,
    FullBody,
};
use crate::server::AppState;
use crate::types::{CollectionInfo, MouError};

#[derive(Debug, Deserialize)]
pub struct MakeSnapshotRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct SnapshotList {
    pub mou: String,
    pub snapshots: Vec<CollectionInfo>,
}

pub async fn handle_list_snapshots<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(list_snapshots(req, &state, mou).await)
}

async fn list_snapshots<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "list_snapshots")?;

    // Admin-only snapshots need both the role and the explicit request
    let show_admin = flag(&query_params(req.uri()), "is_admin") && identity.is_admin();

    let live = state.store.live_collection_name(mou).await?;
    let mut snapshots: Vec<CollectionInfo> = state
        .store
        .list_collections(mou)
        .await?
        .into_iter()
        .filter(|c| Some(&c.name) != live.as_ref())
        .filter(|c| show_admin || !c.admin_only)
        .collect();
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(json_response(
        StatusCode::OK,
        &SnapshotList {
            mou: mou.to_string(),
            snapshots,
        },
    ))
}

pub async fn handle_make_snapshot<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    respond(make_snapshot(req, &state, mou).await)
}

async fn make_snapshot<B>(
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
    require(&identity, "make_snapshot")?;

    let request: MakeSnapshotRequest = read_json(req).await?;
    let label = request.name.trim();
    if label.is_empty() {
        return Err(MouError::BadRequest("snapshot name is required".into()));
    }

    let info = state
        .store
        .create_snapshot(mou, CollectionInfo::new(label, &identity.subject, Utc::now()))
        .await?;
    state
        .audit
        .log_snapshot(mou, &identity.subject, &info.name, &info.label)
        .await;

    Ok(json_response(StatusCode::CREATED, &info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{body_json, request, state, token};
    use crate::types::{Marker, RecordBody, RowId, TaskRecord};
    use serde_json::json;

    async fn seed(state: &AppState) {
        let mut body = RecordBody::task("InstA", 2023);
        body.fte = Some(1.0);
        let at = Utc::now() - chrono::Duration::minutes(5);
        state
            .store
            .bulk_load(
                "mo",
                CollectionInfo::new("Initial Import", "admin", at),
                vec![TaskRecord::new(RowId::from("R1"), body, Marker::origin())],
            )
            .await
            .unwrap();
        let hidden = CollectionInfo::new("Before Import", "admin (auto)", at - chrono::Duration::minutes(1))
            .admin_only();
        state.store.create_snapshot("mo", hidden).await.unwrap();
    }

    #[tokio::test]
    async fn test_make_then_list() {
        let state = state();
        seed(&state).await;
        let pi = token(&state, "alice", &["InstA"], "write");

        let made = handle_make_snapshot(
            request("POST", "/snapshots/make/mo", Some(&pi), Some(json!({"name": "Spring review"}))),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(made.status(), StatusCode::CREATED);
        assert_eq!(body_json(made).await["creator"], "alice");

        let listed = handle_list_snapshots(
            request("GET", "/snapshots/list/mo?is_admin=true", Some(&pi), None),
            state,
            "mo",
        )
        .await;
        let body = body_json(listed).await;
        let labels: Vec<&str> = body["snapshots"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["label"].as_str().unwrap())
            .collect();
        // Not an admin, so the admin-only snapshot stays hidden
        assert_eq!(labels, vec!["Spring review"]);
    }

    #[tokio::test]
    async fn test_admin_sees_hidden_when_asked() {
        let state = state();
        seed(&state).await;
        let admin = token(&state, "root", &[], "admin");

        let default = handle_list_snapshots(
            request("GET", "/snapshots/list/mo", Some(&admin), None),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(body_json(default).await["snapshots"], json!([]));

        let asked = handle_list_snapshots(
            request("GET", "/snapshots/list/mo?is_admin=true", Some(&admin), None),
            state,
            "mo",
        )
        .await;
        let body = body_json(asked).await;
        assert_eq!(body["snapshots"][0]["label"], "Before Import");
    }

    #[tokio::test]
    async fn test_reader_cannot_make_snapshot() {
        let state = state();
        seed(&state).await;
        let reader = token(&state, "dave", &[], "read");

        let response = handle_make_snapshot(
            request("POST", "/snapshots/make/mo", Some(&reader), Some(json!({"name": "x"}))),
            state,
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
