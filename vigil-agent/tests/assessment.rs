use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use vigil_agent::assessment::{Assessor, ScanSource};
use vigil_agent::jobs::{PollPolicy, ScanOrchestrator};
use vigil_agent::metrics::{Intensity, Snapshot};
use vigil_agent::risk::{RiskAggregator, SafetyLevel, ScanSignal, DEFAULT_EXPLANATION};
use vigil_agent::stability::{DeltaRow, Stability, StabilityReport, StabilityService};
use vigil_agent::ContextId;
use vigil_devkit::{CannedGenerator, MockJobService, MockStabilityService};

type TestAssessor = Assessor<MockJobService, MockStabilityService, CannedGenerator>;

fn assessor(jobs: MockJobService, stability: MockStabilityService, generator: CannedGenerator) -> TestAssessor {
    let orchestrator = ScanOrchestrator::new(
        jobs,
        PollPolicy {
            interval: Duration::from_millis(2500),
            max_attempts: 5,
        },
    );
    Assessor::new(ScanSource::Remote(orchestrator), stability, RiskAggregator::new(generator))
}

fn snapshot(intensity: Intensity) -> Snapshot {
    Snapshot {
        context_id: ContextId(1),
        cpu_percent: 12.0,
        cpu_delta: 1.5,
        ram_mb: 18.0,
        ram_delta: -0.75,
        network_delta_bytes: 2048,
        network_total_bytes: 4096,
        network_incomplete: false,
        load_time_ms: Some(80.0),
        intensity,
        captured_at: Utc::now(),
    }
}

fn stable() -> StabilityReport {
    StabilityReport {
        cpu: Stability::Stable,
        memory: Stability::Stable,
        network: Stability::Stable,
    }
}

#[tokio::test(start_paused = true)]
async fn clean_stable_site_gets_the_generated_score() {
    let assessor = assessor(
        MockJobService::completing_after(1, json!({ "output": "No malicious patterns were detected" })),
        MockStabilityService::with_report(stable()),
        CannedGenerator::new(["92\nKnown domain, clean scan and steady resource use."]),
    );

    let assessment = assessor
        .assess("https://example.com/login", Some(&snapshot(Intensity::Low)))
        .await;

    assert_eq!(assessment.domain, "example.com");
    assert_eq!(assessment.score, 92);
    assert_eq!(assessment.safety, SafetyLevel::High);
    assert_eq!(assessment.explanation, "Known domain, clean scan and steady resource use.");
    assert!(!assessment.fallback);
    assert_eq!(assessment.inputs.scan, ScanSignal::Clean);

    let prompts = assessor.aggregator().generator().prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Resource Intensity: Low"));
    assert!(prompts[0].contains("- CPU: Stable"));
    assert!(prompts[0].contains("No malicious patterns were detected"));
    assert!(prompts[0].contains("- example.com"));
}

#[tokio::test(start_paused = true)]
async fn unparseable_reply_falls_back_to_zero() {
    let assessor = assessor(
        MockJobService::completing_after(0, json!({ "output": "No malicious patterns were detected" })),
        MockStabilityService::new(),
        CannedGenerator::new(["not sure"]),
    );

    let assessment = assessor.assess("https://example.org", None).await;

    assert_eq!(assessment.score, 0);
    assert_eq!(assessment.safety, SafetyLevel::Low);
    assert_eq!(assessment.explanation, DEFAULT_EXPLANATION);
    assert!(assessment.fallback);

    let prompt = &assessor.aggregator().generator().prompts()[0];
    assert!(prompt.contains("Resource Intensity: Unknown"));
    assert!(prompt.contains("- Memory Usage: Unknown"));
}

#[tokio::test(start_paused = true)]
async fn generator_failure_still_yields_an_assessment() {
    let assessor = assessor(
        MockJobService::completing_after(0, json!({ "output": "No malicious patterns were detected" })),
        MockStabilityService::new(),
        CannedGenerator::failing(),
    );

    let assessment = assessor.assess("https://example.net", None).await;

    assert!(assessment.fallback);
    assert_eq!(assessment.score, 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_scan_is_reported_as_unknown() {
    let stability = MockStabilityService::new();
    stability.set_script_error(Some("zscore.py exited with 1"));
    let assessor = assessor(MockJobService::stuck(), stability, CannedGenerator::new(["40 Scan missing."]));

    let assessment = assessor
        .assess("https://suspicious.example", Some(&snapshot(Intensity::High)))
        .await;

    assert!(matches!(assessment.inputs.scan, ScanSignal::Unknown { .. }));
    assert_eq!(assessment.inputs.stability, None);
    assert_eq!(assessment.score, 40);
    assert_eq!(assessment.safety, SafetyLevel::Low);
    assert_eq!(assessor.stability().rows().len(), 0);
}

#[tokio::test]
async fn snapshot_deltas_feed_the_stability_service() {
    let service = MockStabilityService::new();

    service.submit_row(&DeltaRow::from_snapshot(&snapshot(Intensity::Low))).await.unwrap();
    service.set_report(Some(StabilityReport {
        network: Stability::Unstable,
        ..stable()
    }));

    assert_eq!(
        service.csv(),
        "cpu_delta,memory_delta,network_delta\n1.50,-0.75,2048\n"
    );
    let report = service.latest().await.unwrap().unwrap();
    assert_eq!(report.unstable_metrics(), vec!["network"]);
    assert!(!report.is_stable());
}
