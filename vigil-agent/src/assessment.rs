//! Per-tab assessment pipeline
//!
//! Runs the page scan and the stability lookup concurrently, then hands the
//! results to the risk aggregator together with the tab's intensity class.

use crate::jobs::{JobKind, JobService, Resolution, ScanOrchestrator};
use crate::metrics::Snapshot;
use crate::risk::{domain_from_url, RiskAggregator, RiskAssessment, RiskInputs, ScanSignal, TextGenerator};
use crate::scanner::ScanRunner;
use crate::stability::{StabilityReport, StabilityService};
use serde_json::json;
use tracing::{info, warn};

const RESTRICTED_PREFIXES: &[&str] = &["chrome://", "chrome-extension://"];
const RESTRICTED_FRAGMENTS: &[&str] = &["docs.google.com", "gemini"];

/// URLs the agent never instruments
pub fn is_restricted(url: &str) -> bool {
    RESTRICTED_PREFIXES.iter().any(|prefix| url.starts_with(prefix))
        || RESTRICTED_FRAGMENTS.iter().any(|fragment| url.contains(fragment))
}

/// Where page scans run
pub enum ScanSource<S: JobService> {
    Remote(ScanOrchestrator<S>),
    Local(ScanRunner),
}

pub struct Assessor<S: JobService, St: StabilityService, G: TextGenerator> {
    scans: ScanSource<S>,
    stability: St,
    aggregator: RiskAggregator<G>,
}

impl<S: JobService, St: StabilityService, G: TextGenerator> Assessor<S, St, G> {
    pub fn new(scans: ScanSource<S>, stability: St, aggregator: RiskAggregator<G>) -> Self {
        Self {
            scans,
            stability,
            aggregator,
        }
    }

    pub fn stability(&self) -> &St {
        &self.stability
    }

    pub fn aggregator(&self) -> &RiskAggregator<G> {
        &self.aggregator
    }

    pub async fn scan(&self, url: &str) -> ScanSignal {
        match &self.scans {
            ScanSource::Remote(orchestrator) => {
                match orchestrator.run(JobKind::PageScan, &json!({ "url": url })).await {
                    Ok(outcome) => match outcome.resolution {
                        Resolution::Completed { verdict, .. } => verdict.into(),
                        Resolution::Failed { reason } => ScanSignal::Unknown { reason },
                        Resolution::TimedOut => ScanSignal::Unknown {
                            reason: format!("scan job {} timed out", outcome.ticket.id),
                        },
                    },
                    Err(e) => ScanSignal::Unknown { reason: e.to_string() },
                }
            }
            ScanSource::Local(runner) => match runner.scan(url).await {
                Ok(report) => report.verdict.into(),
                Err(e) => ScanSignal::Unknown { reason: e.to_string() },
            },
        }
    }

    async fn latest_stability(&self) -> Option<StabilityReport> {
        match self.stability.latest().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Stability report unavailable: {}", e);
                None
            }
        }
    }

    /// Scores one tab. Never fails; missing evidence is passed on as unknown.
    pub async fn assess(&self, url: &str, snapshot: Option<&Snapshot>) -> RiskAssessment {
        let domain = domain_from_url(url).unwrap_or_else(|| url.to_string());
        let (scan, stability) = futures::join!(self.scan(url), self.latest_stability());

        let assessment = self
            .aggregator
            .assess(RiskInputs {
                domain,
                intensity: snapshot.map(|s| s.intensity),
                scan,
                stability,
            })
            .await;

        info!(
            "Assessed {}: score {} ({:?})",
            assessment.domain, assessment.score, assessment.safety
        );
        assessment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_urls() {
        assert!(is_restricted("chrome://extensions"));
        assert!(is_restricted("chrome-extension://abcdef/popup.html"));
        assert!(is_restricted("https://docs.google.com/document/d/1"));
        assert!(is_restricted("https://gemini.google.com/app"));
        assert!(!is_restricted("https://example.com"));
    }
}
