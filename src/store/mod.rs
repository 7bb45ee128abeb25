//! Persistence boundary: bug reports and daily metric rollups
//!
//! Documents are posted to a REST endpoint configured by `STORE_URL`.
//! Without a configured endpoint the store runs disabled and only logs.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::util::time::unix_millis;

/// Daily aggregate persisted at local midnight, keyed by date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRollup {
    pub date: String,
    pub total_players_connected: u64,
    pub peak_concurrent_players: u64,
    pub avg_concurrent_players: f64,
    pub total_rounds_played: u64,
    pub total_disconnects: u64,
    pub temporary_disconnects: u64,
    pub reconnects: u64,
    pub reconnect_rate: f64,
    pub slow_loops_count: u64,
    pub error_count: u64,
    #[serde(rename = "peakMemoryUsageMB")]
    pub peak_memory_usage_mb: f64,
    #[serde(rename = "peakBandwidthMBPerSec")]
    pub peak_bandwidth_mb_per_sec: f64,
}

/// A client-submitted bug report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BugReport {
    pub bug_report: String,
    pub submitted_at: u64,
}

impl BugReport {
    pub fn new(bug_report: String) -> Self {
        Self {
            bug_report,
            submitted_at: unix_millis(),
        }
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Store returned error status {status}: {body}")]
    Api { status: u16, body: String },
}

/// REST persistence client. Cheap to clone; all methods are fire-and-await.
#[derive(Clone)]
pub struct Store {
    inner: Option<StoreClient>,
}

#[derive(Clone)]
struct StoreClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl Store {
    pub fn from_config(config: &Config) -> Self {
        let inner = config.store_url.as_ref().map(|url| StoreClient {
            client: Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
            api_key: config.store_api_key.clone(),
        });
        if inner.is_none() {
            info!("no STORE_URL configured, persistence disabled");
        }
        Self { inner }
    }

    /// A store with no backing endpoint (tests, local runs)
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub async fn insert_bug_report(&self, report: &BugReport) -> Result<(), StoreError> {
        match &self.inner {
            Some(client) => client.post("bug_reports", report).await,
            None => {
                debug!(report = %report.bug_report, "bug report dropped (store disabled)");
                Ok(())
            }
        }
    }

    /// Upsert keyed by the rollup's date: one document per day.
    pub async fn upsert_daily_rollup(&self, rollup: &DailyRollup) -> Result<(), StoreError> {
        match &self.inner {
            Some(client) => {
                client
                    .put(&format!("daily_rollups/{}", rollup.date), rollup)
                    .await
            }
            None => {
                debug!(date = %rollup.date, "daily rollup dropped (store disabled)");
                Ok(())
            }
        }
    }
}

impl StoreClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), StoreError> {
        let request = self.client.post(self.url(path)).json(body);
        Self::check(self.with_auth(request).send().await?).await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<(), StoreError> {
        let request = self.client.put(self.url(path)).json(body);
        Self::check(self.with_auth(request).send().await?).await
    }

    async fn check(response: reqwest::Response) -> Result<(), StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Api {
            status: status.as_u16(),
            body,
        })
    }
}
