//! mou-rest - REST server for MoU statement-of-work tables

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mou_rest::{
    config::{Args, LogFormat, StoreBackend},
    db::MongoClient,
    directory::{
        spawn_refresh_task, CachedDirectory, InstitutionDirectory, RemoteDirectory,
        StaticDirectory,
    },
    logging::AuditLogger,
    server::{self, AppState},
    store::{MemoryStore, MongoStore, RecordStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mou_rest={},info", args.log_level).into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  mou-rest");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MoUs: {}", args.mou_list().join(", "));
    info!("Store: {:?}", args.store);
    if args.store == StoreBackend::Mongo {
        info!("MongoDB: {} (databases {}_<mou>)", args.mongodb_uri, args.mongodb_db);
    }
    info!("======================================");

    let store: Arc<dyn RecordStore> = match args.store {
        StoreBackend::Mongo => {
            let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
            info!("MongoDB connected successfully");
            Arc::new(MongoStore::new(mongo))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    for mou in args.mou_list() {
        store.ensure_live(&mou).await?;
    }

    let override_directory: Option<Arc<dyn InstitutionDirectory>> = match &args.directory_override
    {
        Some(path) => {
            let directory = StaticDirectory::from_file(path)?;
            info!("Directory override loaded from {}", path.display());
            Some(Arc::new(directory) as Arc<dyn InstitutionDirectory>)
        }
        None => None,
    };

    // The live service backs authorization whenever it is configured; the
    // override then only resolves institutions during ingestion.
    let (directory, ingest_directory): (
        Arc<dyn InstitutionDirectory>,
        Option<Arc<dyn InstitutionDirectory>>,
    ) =
        match &args.directory_url {
            Some(url) => {
                let mut remote =
                    RemoteDirectory::new(url, args.experiment_list(), args.request_timeout())?;
                if let Some(ref token) = args.directory_token {
                    remote = remote.with_token(token.clone());
                }
                let cache = Arc::new(CachedDirectory::new(
                    Arc::new(remote),
                    args.directory_max_age(),
                ));
                spawn_refresh_task(Arc::clone(&cache), args.directory_refresh());
                info!("Directory: {} (max age {}s)", url, args.directory_max_age_secs);
                (cache as Arc<dyn InstitutionDirectory>, override_directory)
            }
            None => match override_directory {
                Some(directory) => (directory, None),
                None => {
                    warn!("No institution directory configured, every PI is read-only");
                    let empty: Arc<dyn InstitutionDirectory> =
                        Arc::new(StaticDirectory::new(Vec::new()));
                    (empty, None)
                }
            },
        };

    let audit = AuditLogger::new();
    if let Some(ref path) = args.audit_log {
        audit.init_file(path.clone()).await?;
        info!("Audit log: {}", path.display());
    }

    let state = Arc::new(AppState::new(
        args,
        store,
        directory,
        ingest_directory,
        audit,
    )?);

    server::run(state).await?;
    Ok(())
}
