//! Stability signal exchange
//!
//! Pushes one row of tick deltas to the stability service, which rewrites its
//! CSV, reruns the z-score script and keeps the latest per-metric verdict.

use crate::metrics::Snapshot;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const CSV_HEADER: &str = "cpu_delta,memory_delta,network_delta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    Stable,
    Unstable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub cpu: Stability,
    pub memory: Stability,
    pub network: Stability,
}

impl StabilityReport {
    pub fn unstable_metrics(&self) -> Vec<&'static str> {
        [("cpu", self.cpu), ("memory", self.memory), ("network", self.network)]
            .into_iter()
            .filter(|(_, stability)| *stability == Stability::Unstable)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_stable(&self) -> bool {
        self.unstable_metrics().is_empty()
    }
}

/// One data row of the stability CSV
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeltaRow {
    pub cpu_delta: f64,
    pub memory_delta: f64,
    pub network_delta: u64,
}

impl DeltaRow {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            cpu_delta: snapshot.cpu_delta,
            memory_delta: snapshot.ram_delta,
            network_delta: snapshot.network_delta_bytes,
        }
    }

    pub fn to_csv_row(&self) -> String {
        format!("{:.2},{:.2},{}\n", self.cpu_delta, self.memory_delta, self.network_delta)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StabilityError {
    #[error("stability service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stability script failed: {0}")]
    Script(String),
    #[error("unexpected stability response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait StabilityService: Send + Sync {
    async fn submit_row(&self, row: &DeltaRow) -> Result<(), StabilityError>;

    /// Latest report, or `None` before the service has produced one
    async fn latest(&self) -> Result<Option<StabilityReport>, StabilityError>;
}

/// Decodes a `/zscore` body
pub fn parse_report(body: &Value) -> Result<Option<StabilityReport>, StabilityError> {
    if let Some(error) = body.get("error") {
        let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Err(StabilityError::Script(message));
    }
    if body.as_object().is_some_and(|map| map.is_empty()) || body.is_null() {
        return Ok(None);
    }
    serde_json::from_value(body.clone())
        .map(Some)
        .map_err(|e| StabilityError::Malformed(e.to_string()))
}

pub struct HttpStabilityService {
    client: Client,
    base_url: String,
}

impl HttpStabilityService {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StabilityService for HttpStabilityService {
    async fn submit_row(&self, row: &DeltaRow) -> Result<(), StabilityError> {
        let response = self
            .client
            .post(format!("{}/write-csv", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(row.to_csv_row())
            .send()
            .await?;

        if response.status().is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(StabilityError::Script(body));
        }
        response.error_for_status()?;
        debug!("Submitted stability row {:?}", row);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<StabilityReport>, StabilityError> {
        let body: Value = self
            .client
            .get(format!("{}/zscore", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_report(&body)
    }
}
