//! Bounded-age directory cache
//!
//! Refreshed in the background; a snapshot older than `max_age` is never
//! served. When it goes stale and an inline refresh fails, lookups report
//! the directory as unavailable so authorization fails closed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{DirectoryError, Institution, InstitutionDirectory};

struct Snapshot {
    institutions: Vec<Institution>,
    fetched_at: Instant,
}

/// Caching wrapper around another directory
pub struct CachedDirectory {
    inner: Arc<dyn InstitutionDirectory>,
    snapshot: RwLock<Option<Snapshot>>,
    max_age: Duration,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn InstitutionDirectory>, max_age: Duration) -> Self {
        Self {
            inner,
            snapshot: RwLock::new(None),
            max_age,
        }
    }

    /// Fetch a fresh snapshot, keeping the old one on failure
    pub async fn refresh(&self) -> Result<usize, DirectoryError> {
        let institutions = self.inner.list().await?;
        let count = institutions.len();
        *self.snapshot.write().await = Some(Snapshot {
            institutions,
            fetched_at: Instant::now(),
        });
        debug!(institutions = count, "Directory cache refreshed");
        Ok(count)
    }

    async fn fresh(&self) -> Option<Vec<Institution>> {
        let guard = self.snapshot.read().await;
        guard
            .as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.max_age)
            .map(|s| s.institutions.clone())
    }

    /// Age of the cached snapshot, if any
    pub async fn age(&self) -> Option<Duration> {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|s| s.fetched_at.elapsed())
    }
}

#[async_trait]
impl InstitutionDirectory for CachedDirectory {
    async fn list(&self) -> Result<Vec<Institution>, DirectoryError> {
        if let Some(institutions) = self.fresh().await {
            return Ok(institutions);
        }

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Directory snapshot stale and refresh failed");
            return Err(DirectoryError::Unavailable(format!(
                "no directory snapshot younger than {}s",
                self.max_age.as_secs()
            )));
        }

        self.fresh().await.ok_or_else(|| {
            DirectoryError::Unavailable("directory snapshot expired immediately".into())
        })
    }
}

/// Spawn a background task that refreshes the cache periodically
pub fn spawn_refresh_task(cache: Arc<CachedDirectory>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = cache.refresh().await {
                warn!(error = %e, "Directory refresh failed");
            }
            tokio::time::sleep(interval).await;
        }
    });

    info!(
        interval_secs = interval.as_secs(),
        "Directory refresh task started"
    );
}
