//! Configuration for the MoU REST server
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Record store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Mongo,
    /// Process-local store, contents lost on exit
    Memory,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// mou-rest - REST server for MoU statement-of-work tables
#[derive(Parser, Debug, Clone)]
#[command(name = "mou-rest")]
#[command(about = "REST server for MoU statement-of-work tables")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "MOU_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Record store backend
    #[arg(long, env = "MOU_STORE", value_enum, default_value = "mongo")]
    pub store: StoreBackend,

    /// MongoDB connection URI (must point at a replica set for transactions)
    #[arg(long, env = "MOU_MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// Database name prefix; each MoU gets `<prefix>_<mou>`
    #[arg(long, env = "MOU_MONGODB_DB", default_value = "mou")]
    pub mongodb_db: String,

    /// Comma-separated MoU identifiers served by this instance
    #[arg(long, env = "MOUS", default_value = "mo,upgrade")]
    pub mous: String,

    /// HMAC secret for bearer token verification (required in production)
    #[arg(long, env = "MOU_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Expected token issuer (optional)
    #[arg(long, env = "MOU_AUTH_ISSUER")]
    pub auth_issuer: Option<String>,

    /// Token signing algorithm (HS256, HS384, HS512)
    #[arg(long, env = "MOU_AUTH_ALGORITHM", default_value = "HS512")]
    pub auth_algorithm: String,

    /// Prefix of role claims, e.g. `mou` for `mou:write`
    #[arg(long, env = "MOU_AUTH_PREFIX", default_value = "mou")]
    pub auth_prefix: String,

    /// Enable development mode (requests without a token act as admin)
    #[arg(long, env = "MOU_DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Institution directory service URL
    #[arg(long, env = "DIRECTORY_URL")]
    pub directory_url: Option<String>,

    /// Bearer token sent to the directory service
    #[arg(long, env = "DIRECTORY_TOKEN")]
    pub directory_token: Option<String>,

    /// Static directory JSON file used instead of (or alongside) the service
    #[arg(long, env = "DIRECTORY_OVERRIDE")]
    pub directory_override: Option<PathBuf>,

    /// Comma-separated experiments queried on the directory service
    #[arg(long, env = "DIRECTORY_EXPERIMENTS", default_value = "IceCube,IceCube-Gen2")]
    pub directory_experiments: String,

    /// Seconds between background directory refreshes
    #[arg(long, env = "DIRECTORY_REFRESH_SECS", default_value = "300")]
    pub directory_refresh_secs: u64,

    /// Oldest directory snapshot authorization will trust, in seconds
    #[arg(long, env = "DIRECTORY_MAX_AGE_SECS", default_value = "900")]
    pub directory_max_age_secs: u64,

    /// Outbound request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Append-only JSONL audit log file (optional)
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Args {
    /// MoU identifiers served by this instance
    pub fn mou_list(&self) -> Vec<String> {
        split_list(&self.mous)
    }

    pub fn is_known_mou(&self, mou: &str) -> bool {
        self.mou_list().iter().any(|m| m == mou)
    }

    pub fn experiment_list(&self) -> Vec<String> {
        split_list(&self.directory_experiments)
    }

    pub fn directory_refresh(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_secs)
    }

    pub fn directory_max_age(&self) -> Duration {
        Duration::from_secs(self.directory_max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.auth_secret.is_none() {
            return Err("MOU_AUTH_SECRET is required in production mode".to_string());
        }

        let mous = self.mou_list();
        if mous.is_empty() {
            return Err("MOUS must name at least one MoU".to_string());
        }
        if let Some(bad) = mous.iter().find(|m| !crate::types::is_valid_mou(m)) {
            return Err(format!("invalid MoU identifier '{}'", bad));
        }

        if self.directory_max_age_secs < self.directory_refresh_secs {
            return Err(
                "DIRECTORY_MAX_AGE_SECS must be at least DIRECTORY_REFRESH_SECS".to_string(),
            );
        }

        if !self.dev_mode && self.directory_url.is_none() && self.directory_override.is_none() {
            return Err(
                "DIRECTORY_URL or DIRECTORY_OVERRIDE is required in production mode".to_string(),
            );
        }

        Ok(())
    }
}
