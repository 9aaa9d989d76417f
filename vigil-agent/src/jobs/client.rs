use super::{JobId, JobKind, JobService, JobServiceError, ScanJob};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "requestId", alias = "job_id")]
    request_id: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    job: Option<ScanJob>,
    #[serde(default)]
    error: Option<String>,
}

/// Job identifiers come back as plain strings or numbers depending on the store
fn id_from_value(value: &Value) -> Option<JobId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(JobId(s.clone())),
        Value::Number(n) => Some(JobId(n.to_string())),
        Value::Object(map) => map.get("$oid").and_then(id_from_value),
        _ => None,
    }
}

/// reqwest client for the analysis service
pub struct HttpJobService {
    client: Client,
    base_url: String,
}

impl HttpJobService {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn create_job(&self, kind: JobKind, payload: &Value) -> Result<JobId, JobServiceError> {
        let url = format!("{}{}", self.base_url, kind.endpoint());
        debug!("POST {}", url);
        let response = self.client.post(&url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: SubmitResponse = response.json().await?;
        let id = body.request_id.as_ref().and_then(id_from_value);
        match (body.success || id.is_some(), id) {
            (true, Some(id)) => Ok(id),
            (true, None) => Err(JobServiceError::Malformed("submission acknowledged without a job id".into())),
            (false, _) => Err(JobServiceError::Rejected(
                body.error.unwrap_or_else(|| "success=false".into()),
            )),
        }
    }

    async fn read_job(&self, id: &JobId) -> Result<ScanJob, JobServiceError> {
        let url = format!("{}/job/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(JobServiceError::NotFound(id.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ReadResponse = response.json().await?;
        match body.job {
            Some(job) => Ok(job),
            None if !body.success => Err(JobServiceError::Rejected(
                body.error.unwrap_or_else(|| "success=false".into()),
            )),
            None => Err(JobServiceError::Malformed(format!("job {id} missing from response"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submission_accepts_both_id_spellings() {
        let node: SubmitResponse =
            serde_json::from_value(json!({ "success": true, "requestId": "65f0a1" })).unwrap();
        let python: SubmitResponse =
            serde_json::from_value(json!({ "success": true, "job_id": "6d1c-44" })).unwrap();

        assert_eq!(node.request_id.as_ref().and_then(id_from_value), Some(JobId("65f0a1".into())));
        assert_eq!(python.request_id.as_ref().and_then(id_from_value), Some(JobId("6d1c-44".into())));
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(id_from_value(&json!({ "$oid": "abc" })), Some(JobId("abc".into())));
        assert_eq!(id_from_value(&json!(42)), Some(JobId("42".into())));
        assert_eq!(id_from_value(&json!("")), None);
        assert_eq!(id_from_value(&Value::Null), None);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let service = HttpJobService::new("http://localhost:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(service.base_url(), "http://localhost:8080");
    }
}
