/*!
Mock HTTP collaborators

In-memory stand-ins for the services the agent talks to:
- `MockJobService`: job store with a scripted status sequence per job
- `MockStabilityService`: records CSV rows and serves a settable report
- `CannedGenerator`: text generator with queued replies
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use vigil_agent::jobs::{JobId, JobKind, JobService, JobServiceError, JobStatus, ScanJob};
use vigil_agent::risk::{GeneratorError, TextGenerator};
use vigil_agent::stability::{DeltaRow, StabilityError, StabilityReport, StabilityService, CSV_HEADER};

/// Step of a scripted job: what the next read returns
#[derive(Debug, Clone)]
pub enum JobStep {
    Status(JobStatus),
    Processed(Value),
    Failed(String),
    ReadError,
}

#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: Value,
}

/// Job store whose jobs advance through a scripted sequence of reads
pub struct MockJobService {
    script: Mutex<Vec<JobStep>>,
    jobs: Mutex<HashMap<JobId, VecDeque<JobStep>>>,
    submitted: Mutex<Vec<SubmittedJob>>,
    reads: Mutex<u32>,
    reject_submissions: Mutex<Option<String>>,
}

impl MockJobService {
    /// Every job created afterwards replays `steps`, repeating the last one
    pub fn new(steps: Vec<JobStep>) -> Self {
        Self {
            script: Mutex::new(steps),
            jobs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            reads: Mutex::new(0),
            reject_submissions: Mutex::new(None),
        }
    }

    /// Job that is pending for `pending_reads` reads then processed with `result`
    pub fn completing_after(pending_reads: usize, result: Value) -> Self {
        let mut steps = vec![JobStep::Status(JobStatus::Pending); pending_reads];
        steps.push(JobStep::Processed(result));
        Self::new(steps)
    }

    /// Job that never leaves `pending`
    pub fn stuck() -> Self {
        Self::new(vec![JobStep::Status(JobStatus::Pending)])
    }

    pub fn reject_submissions(&self, reason: &str) {
        *self.reject_submissions.lock() = Some(reason.to_string());
    }

    pub fn submitted(&self) -> Vec<SubmittedJob> {
        self.submitted.lock().clone()
    }

    pub fn read_count(&self) -> u32 {
        *self.reads.lock()
    }
}

fn job_for(step: &JobStep) -> Result<ScanJob, JobServiceError> {
    let (status, result, error) = match step {
        JobStep::Status(status) => (*status, None, None),
        JobStep::Processed(result) => (JobStatus::Processed, Some(result.clone()), None),
        JobStep::Failed(reason) => (JobStatus::Failed, None, Some(reason.clone())),
        JobStep::ReadError => return Err(JobServiceError::Malformed("simulated read failure".into())),
    };
    Ok(ScanJob {
        status,
        result,
        created_at: None,
        processed_at: None,
        error,
    })
}

#[async_trait]
impl JobService for MockJobService {
    async fn create_job(&self, kind: JobKind, payload: &Value) -> Result<JobId, JobServiceError> {
        if let Some(reason) = self.reject_submissions.lock().clone() {
            return Err(JobServiceError::Rejected(reason));
        }

        let mut submitted = self.submitted.lock();
        let id = JobId(format!("job-{}", submitted.len() + 1));
        submitted.push(SubmittedJob {
            id: id.clone(),
            kind,
            payload: payload.clone(),
        });
        self.jobs.lock().insert(id.clone(), self.script.lock().iter().cloned().collect());
        log::info!("📥 [MOCK] Created {} job {}", kind, id);
        Ok(id)
    }

    async fn read_job(&self, id: &JobId) -> Result<ScanJob, JobServiceError> {
        *self.reads.lock() += 1;
        let mut jobs = self.jobs.lock();
        let steps = jobs.get_mut(id).ok_or_else(|| JobServiceError::NotFound(id.clone()))?;
        let step = if steps.len() > 1 { steps.pop_front() } else { steps.front().cloned() };
        match step {
            Some(step) => job_for(&step),
            None => Err(JobServiceError::Malformed(format!("job {id} has no script"))),
        }
    }
}

/// Stability service that keeps rows in memory
#[derive(Default)]
pub struct MockStabilityService {
    rows: Mutex<Vec<DeltaRow>>,
    report: Mutex<Option<StabilityReport>>,
    script_error: Mutex<Option<String>>,
}

impl MockStabilityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report(report: StabilityReport) -> Self {
        let service = Self::default();
        *service.report.lock() = Some(report);
        service
    }

    pub fn set_report(&self, report: Option<StabilityReport>) {
        *self.report.lock() = report;
    }

    /// Makes the z-score script fail until cleared with `None`
    pub fn set_script_error(&self, error: Option<&str>) {
        *self.script_error.lock() = error.map(str::to_string);
    }

    pub fn rows(&self) -> Vec<DeltaRow> {
        self.rows.lock().clone()
    }

    /// CSV file contents as the service would write them
    pub fn csv(&self) -> String {
        let rows: String = self.rows.lock().iter().map(DeltaRow::to_csv_row).collect();
        format!("{CSV_HEADER}\n{rows}")
    }
}

#[async_trait]
impl StabilityService for MockStabilityService {
    async fn submit_row(&self, row: &DeltaRow) -> Result<(), StabilityError> {
        self.rows.lock().push(*row);
        match self.script_error.lock().clone() {
            Some(error) => Err(StabilityError::Script(error)),
            None => Ok(()),
        }
    }

    async fn latest(&self) -> Result<Option<StabilityReport>, StabilityError> {
        if let Some(error) = self.script_error.lock().clone() {
            return Err(StabilityError::Script(error));
        }
        Ok(*self.report.lock())
    }
}

/// Text generator returning queued replies; fails once the queue is empty
#[derive(Default)]
pub struct CannedGenerator {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl CannedGenerator {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Generator that always fails
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError> {
        self.prompts.lock().push(prompt.to_string());
        self.replies.lock().pop_front().ok_or(GeneratorError::Empty)
    }
}
