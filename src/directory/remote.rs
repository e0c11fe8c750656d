//! HTTP client for the live institution directory

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::{parse_directory_json, DirectoryError, Institution, InstitutionDirectory};

/// Directory fetched over HTTP
///
/// `url` must return the flat directory JSON. With several experiments the
/// url is queried once per experiment (`?experiment=`) and the results are
/// merged by short name, first occurrence winning.
pub struct RemoteDirectory {
    url: String,
    experiments: Vec<String>,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl RemoteDirectory {
    pub fn new(url: &str, experiments: Vec<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            experiments,
            token: None,
            http_client,
        })
    }

    /// Send a bearer token with every request
    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    async fn fetch(&self, experiment: Option<&str>) -> Result<Vec<Institution>, DirectoryError> {
        let mut request = self.http_client.get(&self.url);
        if let Some(exp) = experiment {
            request = request.query(&[("experiment", exp)]);
        }
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %self.url, error = %e, "Directory request failed");
            DirectoryError::Unavailable(e.to_string())
        })?;

        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "directory returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        parse_directory_json(&body)
    }
}

#[async_trait]
impl InstitutionDirectory for RemoteDirectory {
    async fn list(&self) -> Result<Vec<Institution>, DirectoryError> {
        if self.experiments.is_empty() {
            return self.fetch(None).await;
        }

        let mut merged: Vec<Institution> = Vec::new();
        for exp in &self.experiments {
            for inst in self.fetch(Some(exp)).await? {
                if !merged.iter().any(|m| m.short_name == inst.short_name) {
                    merged.push(inst);
                }
            }
        }
        debug!(institutions = merged.len(), "Fetched institution directory");
        Ok(merged)
    }
}
