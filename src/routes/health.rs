//! Health check endpoint
//!
//! `/health` and `/healthz` answer 200 while the process runs. The body
//! reports `degraded` when the record store cannot be read.

use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::{json_response, FullBody};
use crate::config::StoreBackend;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// `online` or `degraded`
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    pub mode: &'static str,
    pub store: &'static str,
    pub mous: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn health_check(state: Arc<AppState>) -> Response<FullBody> {
    let mous = state.args.mou_list();

    let mut error = None;
    for mou in &mous {
        if let Err(e) = state.store.live_collection_name(mou).await {
            error = Some(format!("{}: {}", mou, e));
            break;
        }
    }

    let response = HealthResponse {
        healthy: true,
        status: if error.is_none() { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        store: match state.args.store {
            StoreBackend::Mongo => "mongo",
            StoreBackend::Memory => "memory",
        },
        mous,
        error,
    };

    json_response(StatusCode::OK, &response)
}
