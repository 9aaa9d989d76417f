//! Scan jobs against the remote analysis service
//!
//! The service queues a job per request and a worker moves it through
//! `pending -> processing -> processed | failed`. The agent submits, then
//! polls the job record until it reaches a terminal status or the attempt
//! budget runs out.

pub mod client;
pub mod orchestrator;
pub mod verdict;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use client::HttpJobService;
pub use orchestrator::{JobTicket, PollPolicy, Resolution, ScanOrchestrator, ScanOutcome};
pub use verdict::{extract_verdict, ScanVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Analyze,
    BehavioralTest,
    PageScan,
}

impl JobKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            JobKind::Analyze => "/analyze",
            JobKind::BehavioralTest => "/ztest",
            JobKind::PageScan => "/scanpage",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Analyze => "analyze",
            JobKind::BehavioralTest => "behavioral-test",
            JobKind::PageScan => "page-scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Processed | JobStatus::Failed)
    }

    /// Whether an observer that saw `self` may accept `next` without going backwards
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (current, next) if *current == next => true,
            (JobStatus::Pending, _) => true,
            (JobStatus::Processing, JobStatus::Processed | JobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Opaque job identifier assigned by the service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job record as returned by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<Value>,
    #[serde(default, alias = "processedAt")]
    pub processed_at: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("job service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("job service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("job service rejected the request: {0}")]
    Rejected(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("unexpected job service response: {0}")]
    Malformed(String),
}

/// Job queue as seen by the agent
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, kind: JobKind, payload: &Value) -> Result<JobId, JobServiceError>;

    async fn read_job(&self, id: &JobId) -> Result<ScanJob, JobServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        assert_eq!(JobKind::Analyze.endpoint(), "/analyze");
        assert_eq!(JobKind::BehavioralTest.endpoint(), "/ztest");
        assert_eq!(JobKind::PageScan.endpoint(), "/scanpage");
    }

    #[test]
    fn test_status_never_regresses() {
        use JobStatus::*;
        assert!(Pending.can_advance_to(Processing));
        assert!(Pending.can_advance_to(Processed));
        assert!(Processing.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Failed));
        assert!(!Processing.can_advance_to(Pending));
        assert!(!Processed.can_advance_to(Processing));
        assert!(!Processed.can_advance_to(Failed));
    }

    #[test]
    fn test_job_record_accepts_camel_case_timestamps() {
        let job: ScanJob = serde_json::from_value(serde_json::json!({
            "_id": "65f0",
            "endpoint": "/scanpage",
            "status": "processed",
            "result": { "output": "ok" },
            "createdAt": "2024-03-12T10:00:00Z",
            "processedAt": "2024-03-12T10:00:04Z"
        }))
        .unwrap();

        assert_eq!(job.status, JobStatus::Processed);
        assert!(job.processed_at.is_some());
        assert!(job.status.is_terminal());
    }
}
