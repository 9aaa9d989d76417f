//! Local page scanner
//!
//! Runs the scan script as an external process with a timeout:
//! - `bash <script> <url> <rules>`
//! - stdout is the scan report, judged with the page-scan marker rule
//! - spawn failure, non-zero exit or timeout is a `ScriptError`

use crate::jobs::verdict::output_is_clean;
use crate::jobs::ScanVerdict;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to start scan script: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("scan script timed out after {0:?}")]
    Timeout(Duration),
    #[error("scan script exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

/// Scan result for one URL
#[derive(Debug, Clone, Serialize)]
pub struct PageScanReport {
    pub url: String,
    pub verdict: ScanVerdict,
    pub output: String,
    pub execution_time_ms: u128,
}

#[derive(Debug, Clone)]
pub struct ScanRunner {
    interpreter: String,
    script: PathBuf,
    rules: PathBuf,
    timeout: Duration,
}

impl ScanRunner {
    pub fn new(script: impl Into<PathBuf>, rules: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: "bash".to_string(),
            script: script.into(),
            rules: rules.into(),
            timeout,
        }
    }

    pub async fn scan(&self, url: &str) -> Result<PageScanReport, ScriptError> {
        let start_time = Instant::now();
        info!("Running local scan for {}", url);
        debug!("{} {} {} {}", self.interpreter, self.script.display(), url, self.rules.display());

        let child = AsyncCommand::new(&self.interpreter)
            .arg(&self.script)
            .arg(url)
            .arg(&self.rules)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ScriptError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ScriptError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let verdict = if output_is_clean(&stdout) {
            ScanVerdict::Clean
        } else {
            ScanVerdict::Flagged {
                reasons: vec![format!("page scan: {stdout}")],
            }
        };

        Ok(PageScanReport {
            url: url.to_string(),
            verdict,
            output: stdout,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}
