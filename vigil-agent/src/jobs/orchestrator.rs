use super::verdict::{extract_verdict, ScanVerdict};
use super::{JobId, JobKind, JobService, JobServiceError, JobStatus};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
            max_attempts: 100,
        }
    }
}

/// Handle on a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTicket {
    pub id: JobId,
    pub kind: JobKind,
}

#[derive(Debug, thiserror::Error)]
#[error("submitting {kind} job failed: {source}")]
pub struct SubmissionError {
    pub kind: JobKind,
    #[source]
    pub source: JobServiceError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Completed { verdict: ScanVerdict, result: Value },
    Failed { reason: String },
    TimedOut,
}

/// Final state of a polled job
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub ticket: JobTicket,
    pub attempts: u32,
    /// Statuses accepted while polling, in order
    pub observed: Vec<JobStatus>,
    pub resolution: Resolution,
}

impl ScanOutcome {
    pub fn verdict(&self) -> Option<&ScanVerdict> {
        match &self.resolution {
            Resolution::Completed { verdict, .. } => Some(verdict),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.resolution, Resolution::TimedOut)
    }
}

/// Submits scan jobs and polls them to completion with a bounded budget
pub struct ScanOrchestrator<S: JobService> {
    service: S,
    policy: PollPolicy,
}

impl<S: JobService> ScanOrchestrator<S> {
    pub fn new(service: S, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub async fn submit(&self, kind: JobKind, payload: &Value) -> Result<JobTicket, SubmissionError> {
        let id = self
            .service
            .create_job(kind, payload)
            .await
            .map_err(|source| SubmissionError { kind, source })?;
        info!("Submitted {} job {}", kind, id);
        Ok(JobTicket { id, kind })
    }

    /// Polls until the job is terminal or `max_attempts` reads were made.
    ///
    /// The first read happens immediately. A failed read still consumes an attempt.
    pub async fn poll(&self, ticket: &JobTicket) -> ScanOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut observed: Vec<JobStatus> = Vec::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.interval).await;
            }

            let job = match self.service.read_job(&ticket.id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!("Polling job {} (attempt {}/{}) failed: {}", ticket.id, attempt, max_attempts, e);
                    continue;
                }
            };

            if let Some(last) = observed.last() {
                if !last.can_advance_to(job.status) {
                    warn!("Job {} reported {} after {}, ignoring", ticket.id, job.status, last);
                    continue;
                }
            }
            if observed.last() != Some(&job.status) {
                observed.push(job.status);
            }

            let resolution = match job.status {
                JobStatus::Processed => match job.result {
                    Some(result) => Resolution::Completed {
                        verdict: extract_verdict(ticket.kind, &result),
                        result,
                    },
                    None => Resolution::Failed {
                        reason: "job processed without a result".into(),
                    },
                },
                JobStatus::Failed => Resolution::Failed {
                    reason: job
                        .error
                        .or_else(|| {
                            job.result
                                .as_ref()
                                .and_then(|r| r.get("error"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .unwrap_or_else(|| "job failed".into()),
                },
                JobStatus::Pending | JobStatus::Processing => {
                    debug!("Job {} is {} (attempt {}/{})", ticket.id, job.status, attempt, max_attempts);
                    continue;
                }
            };

            info!("Job {} finished after {} attempt(s)", ticket.id, attempt);
            return ScanOutcome {
                ticket: ticket.clone(),
                attempts: attempt,
                observed,
                resolution,
            };
        }

        warn!("Job {} still not finished after {} attempts", ticket.id, max_attempts);
        ScanOutcome {
            ticket: ticket.clone(),
            attempts: max_attempts,
            observed,
            resolution: Resolution::TimedOut,
        }
    }

    pub async fn run(&self, kind: JobKind, payload: &Value) -> Result<ScanOutcome, SubmissionError> {
        let ticket = self.submit(kind, payload).await?;
        Ok(self.poll(&ticket).await)
    }
}
