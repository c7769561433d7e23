//! Unified Binary Store client
//!
//! Resolves SHA-256 hashes into time-limited download URLs, runs saved
//! process-search queries for scheduled ingestion, and fetches the binaries
//! themselves. The trait seam exists so the pipeline can be exercised
//! against a canned backend in tests.

use crate::config::UbsConfig;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

/// A hash the UBS can serve, with its pre-signed URL.
#[derive(Debug, Clone, Deserialize)]
pub struct FoundBinary {
    pub sha256: String,
    pub url: String,
}

/// Outcome of a resolve call: every input hash lands in exactly one list.
///
/// `error` hashes are transient failures the caller should retry;
/// `not_found` hashes are simply unknown to the store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Resolved {
    pub found: Vec<FoundBinary>,
    pub error: Vec<String>,
    pub not_found: Vec<String>,
}

impl Resolved {
    /// The all-transient-failure outcome used when the UBS itself is
    /// unreachable.
    pub fn all_error(hashes: &[String]) -> Self {
        Self {
            error: hashes.to_vec(),
            ..Default::default()
        }
    }
}

/// Download failure, split so the retry policy can tell a missing URL from
/// everything else.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The pre-signed URL 404ed (typically expired); retryable.
    #[error("binary not found at download URL")]
    NotFound,
    #[error("download failed: {0}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Ubs: Send + Sync {
    /// Resolve hashes to download URLs. Infallible by contract: transport
    /// failures come back as `error = hashes` so callers re-enqueue.
    async fn resolve(&self, hashes: &[String]) -> Resolved;

    /// Run a process-search query, returning the distinct binary hashes of
    /// the matching processes.
    async fn search(&self, query: &str, limit: Option<usize>) -> anyhow::Result<Vec<String>>;

    /// Fetch the bytes behind a resolved URL.
    async fn download(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// HTTP implementation against the UBS/backend API.
pub struct UbsClient {
    http: reqwest::Client,
    config: UbsConfig,
    binary_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    process_sha256: Option<String>,
}

impl UbsClient {
    pub fn new(config: UbsConfig, binary_timeout: Option<Duration>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            binary_timeout,
        }
    }

    /// `X-Auth-Token` value: `<secret>/<id>`.
    fn auth_token(&self) -> String {
        format!("{}/{}", self.config.api_secret, self.config.api_id)
    }

    fn download_endpoint(&self) -> String {
        format!(
            "{}/ubs/v1/orgs/{}/file/_download",
            self.config.url, self.config.org_key
        )
    }

    fn search_endpoint(&self) -> String {
        format!("{}/pscr/query/v1/process", self.config.url)
    }
}

#[async_trait]
impl Ubs for UbsClient {
    async fn resolve(&self, hashes: &[String]) -> Resolved {
        let body = serde_json::json!({
            "sha256": hashes,
            "expiration_seconds": self.config.expiration_seconds,
        });

        let response = self
            .http
            .post(self.download_endpoint())
            .header("X-Auth-Token", self.auth_token())
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Resolved>().await {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::error!("malformed UBS response: {}", e);
                    Resolved::all_error(hashes)
                }
            },
            Ok(resp) => {
                tracing::error!("UBS responded with an error: {}", resp.status());
                Resolved::all_error(hashes)
            }
            Err(e) => {
                tracing::error!("UBS request failed: {}", e);
                Resolved::all_error(hashes)
            }
        }
    }

    async fn search(&self, query: &str, limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        let mut request = self
            .http
            .get(self.search_endpoint())
            .header("X-Auth-Token", self.auth_token())
            .query(&[("q", query)]);
        if let Some(limit) = limit {
            request = request.query(&[("rows", limit.to_string())]);
        }

        let resp = request.send().await?.error_for_status()?;
        let results: SearchResults = resp.json().await?;

        // De-duplicate while preserving first-seen order
        let mut seen = std::collections::HashSet::new();
        let hashes = results
            .results
            .into_iter()
            .filter_map(|hit| hit.process_sha256)
            .filter(|sha| seen.insert(sha.clone()))
            .collect();
        Ok(hashes)
    }

    async fn download(&self, url: &str) -> Result<Bytes, DownloadError> {
        let mut request = self.http.get(url);
        if let Some(timeout) = self.binary_timeout {
            request = request.timeout(timeout);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| DownloadError::Other(e.into()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(DownloadError::Other(anyhow::anyhow!(
                "download failed with status {}",
                resp.status()
            )));
        }

        resp.bytes().await.map_err(|e| DownloadError::Other(e.into()))
    }
}
