//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthorizationGate, JwtValidator};
use crate::config::Args;
use crate::directory::InstitutionDirectory;
use crate::ingest::Ingestor;
use crate::logging::AuditLogger;
use crate::reconcile::ReconciliationEngine;
use crate::routes;
use crate::store::RecordStore;
use crate::types::MouError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn RecordStore>,
    /// Directory consulted for authorization and listings
    pub directory: Arc<dyn InstitutionDirectory>,
    pub gate: AuthorizationGate,
    pub engine: ReconciliationEngine,
    pub ingestor: Ingestor,
    pub jwt: JwtValidator,
    pub audit: AuditLogger,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the components together
    ///
    /// `ingest_directory` replaces `directory` for institution resolution
    /// during ingestion when set.
    pub fn new(
        args: Args,
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn InstitutionDirectory>,
        ingest_directory: Option<Arc<dyn InstitutionDirectory>>,
        audit: AuditLogger,
    ) -> Result<Self, MouError> {
        let jwt = match (&args.auth_secret, args.dev_mode) {
            (Some(secret), _) => JwtValidator::new(
                secret.clone(),
                args.auth_issuer.clone(),
                &args.auth_algorithm,
            )?,
            (None, true) => JwtValidator::new_dev(),
            (None, false) => {
                return Err(MouError::Config(
                    "MOU_AUTH_SECRET is required in production mode".into(),
                ))
            }
        };

        let mut ingestor = Ingestor::new(Arc::clone(&store), Arc::clone(&directory), audit.clone());
        if let Some(dir) = ingest_directory {
            ingestor = ingestor.with_directory_override(dir);
        }

        Ok(Self {
            gate: AuthorizationGate::new(Arc::clone(&directory)),
            engine: ReconciliationEngine::new(
                Arc::clone(&store),
                Arc::clone(&directory),
                audit.clone(),
            ),
            ingestor,
            args,
            store,
            directory,
            jwt,
            audit,
            started_at: Instant::now(),
        })
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), MouError> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(|e| MouError::Config(format!("cannot bind {}: {}", state.args.listen, e)))?;

    info!(
        "mou-rest listening on {} serving {:?}",
        state.args.listen,
        state.args.mou_list()
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - requests without a token act as admin");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub(crate) async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(Arc::clone(&state)).await
        }

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        (Method::GET, "/institution/today") => {
            routes::handle_institutions(req, Arc::clone(&state)).await
        }
        (Method::GET, "/scope") => routes::handle_scope(req, Arc::clone(&state)).await,

        (Method::GET, "/table/config") => {
            routes::handle_table_config(req, Arc::clone(&state)).await
        }
        (Method::GET, p) if p.starts_with("/table/data/") => {
            let mou = p.trim_start_matches("/table/data/").to_string();
            routes::handle_read_table(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/table/data/") => {
            let mou = p.trim_start_matches("/table/data/").to_string();
            routes::handle_ingest_xlsx(req, Arc::clone(&state), &mou).await
        }
        (Method::GET, p) if p.starts_with("/table/dump/") => {
            let mou = p.trim_start_matches("/table/dump/").to_string();
            routes::handle_export_dump(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/table/dump/") => {
            let mou = p.trim_start_matches("/table/dump/").to_string();
            routes::handle_ingest_dump(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/table/edits/") => {
            let mou = p.trim_start_matches("/table/edits/").to_string();
            routes::handle_submit_edits(req, Arc::clone(&state), &mou).await
        }

        (Method::GET, p) if p.starts_with("/snapshots/list/") => {
            let mou = p.trim_start_matches("/snapshots/list/").to_string();
            routes::handle_list_snapshots(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/snapshots/make/") => {
            let mou = p.trim_start_matches("/snapshots/make/").to_string();
            routes::handle_make_snapshot(req, Arc::clone(&state), &mou).await
        }

        (Method::GET, p) if p.starts_with("/institution/values/confirmation/touchstone/") => {
            let mou = p
                .trim_start_matches("/institution/values/confirmation/touchstone/")
                .to_string();
            routes::handle_read_touchstone(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/institution/values/confirmation/touchstone/") => {
            let mou = p
                .trim_start_matches("/institution/values/confirmation/touchstone/")
                .to_string();
            routes::handle_make_touchstone(req, Arc::clone(&state), &mou).await
        }
        (Method::GET, p) if p.starts_with("/institution/values/confirmation/") => {
            let mou = p
                .trim_start_matches("/institution/values/confirmation/")
                .to_string();
            routes::handle_read_confirmation(req, Arc::clone(&state), &mou).await
        }
        (Method::POST, p) if p.starts_with("/institution/values/confirmation/") => {
            let mou = p
                .trim_start_matches("/institution/values/confirmation/")
                .to_string();
            routes::handle_confirm_values(req, Arc::clone(&state), &mou).await
        }

        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "NOT_FOUND",
        "message": "No such route",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
