//! Result sinks - downstream destinations for dispatched results
//!
//! A feed is an append-only report stream at the backend; the dispatcher
//! turns each undispatched AnalysisResult into one report and appends the
//! whole batch. Watchlist delivery is reserved (the dispatcher warns and
//! moves on), so the sink seam only carries feed appends.

use crate::config::UbsConfig;
use crate::model::AnalysisResult;
use async_trait::async_trait;
use serde::Serialize;

/// One feed report, as the sink API expects it.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub id: String,
    /// Unix seconds of the scan.
    pub timestamp: i64,
    /// The originating connector.
    pub title: String,
    /// The analysis pass within the connector.
    pub description: String,
    /// Severity in [1,10]; guaranteed by score normalization at create.
    pub severity: i64,
    pub iocs_v2: Vec<serde_json::Value>,
}

impl Report {
    pub fn from_result(result: &AnalysisResult) -> Self {
        Self {
            id: result.id.to_string(),
            timestamp: result.scan_time.timestamp(),
            title: result.connector_name.clone(),
            description: result.analysis_name.clone(),
            severity: result.score,
            iocs_v2: result.iocs.iter().map(|ioc| ioc.feed_dict()).collect(),
        }
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Append reports to the identified feed. Must be all-or-nothing from
    /// the caller's perspective: an Err means nothing may be marked
    /// dispatched.
    async fn append_reports(&self, feed_id: &str, reports: &[Report]) -> anyhow::Result<()>;
}

/// HTTP sink client against the backend's feed manager.
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
    org_key: String,
    auth_token: String,
}

impl FeedClient {
    /// The feed manager lives on the same backend as the UBS and shares its
    /// credentials.
    pub fn new(config: &UbsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.url.clone(),
            org_key: config.org_key.clone(),
            auth_token: format!("{}/{}", config.api_secret, config.api_id),
        }
    }

    fn reports_endpoint(&self, feed_id: &str) -> String {
        format!(
            "{}/threathunter/feedmgr/v2/orgs/{}/feeds/{}/reports",
            self.base_url, self.org_key, feed_id
        )
    }
}

#[async_trait]
impl ResultSink for FeedClient {
    async fn append_reports(&self, feed_id: &str, reports: &[Report]) -> anyhow::Result<()> {
        let body = serde_json::json!({ "reports": reports });
        let resp = self
            .http
            .post(self.reports_endpoint(feed_id))
            .header("X-Auth-Token", &self.auth_token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!(
                "feed {} rejected {} reports: {}",
                feed_id,
                reports.len(),
                resp.status()
            );
        }
        tracing::info!(feed = feed_id, count = reports.len(), "appended reports");
        Ok(())
    }
}
