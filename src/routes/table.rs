//! Table routes
//!
//! - `GET  /table/config`: per-MoU columns and dropdown menus
//! - `GET  /table/data/{mou}`: read the live collection or a snapshot
//! - `POST /table/data/{mou}`: load an xlsx upload (admin)
//! - `GET  /table/dump/{mou}`: export every collection (admin)
//! - `POST /table/dump/{mou}`: load a raw dump (admin)
//! - `POST /table/edits/{mou}`: submit a reconciliation batch

use bytes::Bytes;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{
    authenticate, check_mou, flag, json_response, query_params, read_json, require, respond,
    FullBody,
};
use crate::migrate::RawDump;
use crate::reconcile::EditOp;
use crate::server::AppState;
use crate::table::{total_rows, TableConfig, TotalRow};
use crate::types::{MouError, TaskRecord};

/// Body of an xlsx upload
#[derive(Debug, Deserialize)]
pub struct XlsxUpload {
    pub base64_file: String,
    #[serde(default)]
    pub filename: String,
}

/// Body of an edit submission
#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub ops: Vec<EditOp>,
}

#[derive(Debug, Serialize)]
pub struct TableResponse {
    pub mou: String,
    pub collection: Option<String>,
    pub n_records: usize,
    pub records: Vec<TaskRecord>,
    /// Computed totals, present when `total_rows=true`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub totals: Vec<TotalRow>,
}

/// Row filters accepted on table reads
#[derive(Debug, Default)]
struct TableFilter {
    institution: Option<String>,
    labor: Option<String>,
    fiscal_year: Option<i32>,
    include_deleted: bool,
}

impl TableFilter {
    fn keeps(&self, record: &TaskRecord) -> bool {
        (self.include_deleted || !record.deleted)
            && self
                .institution
                .as_deref()
                .map_or(true, |i| record.institution().eq_ignore_ascii_case(i))
            && self.labor.as_deref().map_or(true, |l| {
                record
                    .body
                    .labor_category
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(l))
            })
            && self
                .fiscal_year
                .map_or(true, |fy| record.body.fiscal_year == fy)
    }
}

pub async fn handle_read_table<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(read_table(req, &state, mou).await)
}

async fn read_table<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "read_table")?;

    let params = query_params(req.uri());
    let fiscal_year = match params.get("fiscal_year").filter(|v| !v.is_empty()) {
        Some(v) => Some(
            v.parse::<i32>()
                .map_err(|_| MouError::BadRequest(format!("invalid fiscal_year '{}'", v)))?,
        ),
        None => None,
    };
    let filter = TableFilter {
        institution: params.get("institution").filter(|v| !v.is_empty()).cloned(),
        labor: params.get("labor").filter(|v| !v.is_empty()).cloned(),
        fiscal_year,
        include_deleted: flag(&params, "include_deleted"),
    };

    let (collection, rows) = match params.get("snapshot").filter(|v| !v.is_empty()) {
        Some(name) => {
            let info = state
                .store
                .list_collections(mou)
                .await?
                .into_iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| MouError::NotFound(format!("snapshot '{}'", name)))?;
            if info.admin_only && !identity.is_admin() {
                return Err(MouError::Unauthorized(format!(
                    "snapshot '{}' is admin-only",
                    name
                )));
            }
            (Some(info.name.clone()), state.store.get_collection(mou, &info.name).await?)
        }
        None => (
            state.store.live_collection_name(mou).await?,
            state.store.get_live(mou).await?,
        ),
    };

    let records: Vec<TaskRecord> = rows.into_iter().filter(|r| filter.keeps(r)).collect();

    let totals = if flag(&params, "total_rows") {
        let institutions = state.directory.list().await?;
        total_rows(
            mou,
            &records,
            &institutions,
            filter.labor.is_some() || filter.institution.is_some(),
            filter.institution.is_none(),
        )
    } else {
        Vec::new()
    };

    Ok(json_response(
        StatusCode::OK,
        &TableResponse {
            mou: mou.to_string(),
            collection,
            n_records: records.len(),
            records,
            totals,
        },
    ))
}

pub async fn handle_table_config<B>(req: Request<B>, state: Arc<AppState>) -> Response<FullBody> {
    respond(table_config(req, &state).await)
}

async fn table_config<B>(req: Request<B>, state: &AppState) -> Result<Response<FullBody>, MouError> {
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "read_config")?;

    let institutions = state.directory.list().await?;
    let configs: BTreeMap<String, TableConfig> = state
        .args
        .mou_list()
        .into_iter()
        .map(|mou| {
            let config = TableConfig::for_mou(&mou, &institutions);
            (mou, config)
        })
        .collect();
    Ok(json_response(StatusCode::OK, &configs))
}

pub async fn handle_ingest_xlsx<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    respond(ingest_xlsx(req, &state, mou).await)
}

async fn ingest_xlsx<B>(
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
    require(&identity, "ingest_xlsx")?;

    let upload: XlsxUpload = read_json(req).await?;
    let report = state
        .ingestor
        .ingest_xlsx(mou, &upload.base64_file, &upload.filename, &identity.subject)
        .await?;
    Ok(json_response(StatusCode::OK, &report))
}

pub async fn handle_export_dump<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody> {
    respond(export_dump(req, &state, mou).await)
}

async fn export_dump<B>(
    req: Request<B>,
    state: &AppState,
    mou: &str,
) -> Result<Response<FullBody>, MouError> {
    check_mou(state, mou)?;
    let identity = authenticate(req.headers(), state)?;
    require(&identity, "ingest_dump")?;

    let dump = state.ingestor.export_dump(mou).await?;
    Ok(json_response(StatusCode::OK, &dump))
}

pub async fn handle_ingest_dump<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    respond(ingest_dump(req, &state, mou).await)
}

async fn ingest_dump<B>(
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
    require(&identity, "ingest_dump")?;

    let dump: RawDump = read_json(req).await?;
    let report = state
        .ingestor
        .ingest_dump(mou, &dump, &identity.subject)
        .await?;
    Ok(json_response(StatusCode::OK, &report))
}

pub async fn handle_submit_edits<B>(
    req: Request<B>,
    state: Arc<AppState>,
    mou: &str,
) -> Response<FullBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    respond(submit_edits(req, &state, mou).await)
}

async fn submit_edits<B>(
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
    require(&identity, "submit_edits")?;

    let edits: EditRequest = read_json(req).await?;
    let scope = state.gate.scope_for(&identity).await;
    info!(mou = %mou, subject = %identity.subject, ops = edits.ops.len(), "Edit batch received");

    let outcome = state
        .engine
        .submit(mou, &identity, &scope, edits.ops)
        .await?;
    Ok(json_response(StatusCode::OK, &outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{body_json, request, state, token};
    use crate::types::{CollectionInfo, Marker, RecordBody, RowId};
    use chrono::Utc;
    use serde_json::json;

    async fn seed(state: &AppState) {
        let mut a = RecordBody::task("InstA", 2023);
        a.fte = Some(1.0);
        a.labor_category = Some("SC".into());
        let mut b = RecordBody::task("InstB", 2023);
        b.fte = Some(2.0);
        let mut gone = TaskRecord::new(RowId::from("R3"), b.clone(), Marker::origin());
        gone.deleted = true;

        state
            .store
            .bulk_load(
                "mo",
                CollectionInfo::new("Initial Import", "admin", Utc::now()),
                vec![
                    TaskRecord::new(RowId::from("R1"), a, Marker::origin()),
                    TaskRecord::new(RowId::from("R2"), b, Marker::origin()),
                    gone,
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_filters_and_hides_deleted() {
        let state = state();
        seed(&state).await;
        let reader = token(&state, "dave", &[], "read");

        let all = handle_read_table(
            request("GET", "/table/data/mo", Some(&reader), None),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(body_json(all).await["n_records"], 2);

        let with_deleted = handle_read_table(
            request("GET", "/table/data/mo?include_deleted=true", Some(&reader), None),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(body_json(with_deleted).await["n_records"], 3);

        let by_labor = handle_read_table(
            request("GET", "/table/data/mo?labor=sc", Some(&reader), None),
            state.clone(),
            "mo",
        )
        .await;
        let body = body_json(by_labor).await;
        assert_eq!(body["n_records"], 1);
        assert_eq!(body["records"][0]["row_id"], "R1");
    }

    #[tokio::test]
    async fn test_read_with_total_rows() {
        let state = state();
        seed(&state).await;
        let reader = token(&state, "dave", &[], "read");

        let plain = handle_read_table(
            request("GET", "/table/data/mo", Some(&reader), None),
            state.clone(),
            "mo",
        )
        .await;
        assert!(body_json(plain).await.get("totals").is_none());

        let response = handle_read_table(
            request("GET", "/table/data/mo?total_rows=true", Some(&reader), None),
            state.clone(),
            "mo",
        )
        .await;
        let body = body_json(response).await;
        let totals = body["totals"].as_array().unwrap();
        let grand = totals.last().unwrap();
        assert_eq!(grand["total_of"], "grand");
        assert_eq!(grand["fte"], 3.0);
        assert!(totals.iter().any(|t| t["region"] == "Non-US"));

        // Institution filter drops the US split and empty totals
        let response = handle_read_table(
            request(
                "GET",
                "/table/data/mo?total_rows=true&institution=InstA",
                Some(&reader),
                None,
            ),
            state,
            "mo",
        )
        .await;
        let body = body_json(response).await;
        let totals = body["totals"].as_array().unwrap();
        // Blank-WBS L2 total then the grand total
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[1]["total_of"], "grand");
        assert_eq!(totals[1]["fte"], 1.0);
        assert!(totals.iter().all(|t| t.get("region").is_none()));
    }

    #[tokio::test]
    async fn test_table_config_lists_served_mous() {
        let state = state();
        let reader = token(&state, "dave", &[], "read");

        let response =
            handle_table_config(request("GET", "/table/config", Some(&reader), None), state.clone())
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["mo"]["institutions"], json!(["InstA", "InstB"]));
        assert!(body["mo"]["wbs"]["l2_values"].is_array());
        assert_eq!(body["upgrade"]["labor_categories"].as_array().unwrap().len(), 11);

        let anonymous = handle_table_config(request("GET", "/table/config", None, None), state).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_mou_and_missing_token() {
        let state = state();
        let reader = token(&state, "dave", &[], "read");

        let unknown = handle_read_table(
            request("GET", "/table/data/nope", Some(&reader), None),
            state.clone(),
            "nope",
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let anonymous =
            handle_read_table(request("GET", "/table/data/mo", None, None), state, "mo").await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_edits_respect_institution_scope() {
        let state = state();
        seed(&state).await;
        let pi = token(&state, "alice", &["InstA"], "write");

        let foreign = json!({"ops": [{
            "op": "update",
            "row_id": "R2",
            "base_marker": Marker::origin(),
            "record": {"institution": "InstB", "fiscal_year": 2023, "fte": 9.0},
        }]});
        let response = handle_submit_edits(
            request("POST", "/table/edits/mo", Some(&pi), Some(foreign)),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let own = json!({"ops": [{
            "op": "update",
            "row_id": "R1",
            "base_marker": Marker::origin(),
            "record": {"institution": "InstA", "fiscal_year": 2023, "fte": 1.5},
        }]});
        let response = handle_submit_edits(
            request("POST", "/table/edits/mo", Some(&pi), Some(own.clone())),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "applied");
        assert_eq!(body["records"][0]["marker"]["revision"], 1);

        // Same base again is stale
        let response = handle_submit_edits(
            request("POST", "/table/edits/mo", Some(&pi), Some(own)),
            state,
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["row_ids"], json!(["R1"]));
    }

    #[tokio::test]
    async fn test_ingest_requires_admin() {
        let state = state();
        let pi = token(&state, "alice", &["InstA"], "write");

        let response = handle_ingest_xlsx(
            request(
                "POST",
                "/table/data/mo",
                Some(&pi),
                Some(json!({"base64_file": "", "filename": "x.xlsx"})),
            ),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = token(&state, "root", &[], "admin");
        let response = handle_ingest_xlsx(
            request(
                "POST",
                "/table/data/mo",
                Some(&admin),
                Some(json!({"base64_file": "bm90IGEgd29ya2Jvb2s=", "filename": "x.xlsx"})),
            ),
            state,
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dump_export_and_reload() {
        let state = state();
        seed(&state).await;
        let admin = token(&state, "root", &[], "admin");

        let response = handle_export_dump(
            request("GET", "/table/dump/mo", Some(&admin), None),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let dump = body_json(response).await;

        let response = handle_ingest_dump(
            request("POST", "/table/dump/mo", Some(&admin), Some(dump)),
            state.clone(),
            "mo",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["n_records"], 3);
        assert!(report["before_import"].is_string());
    }
}
