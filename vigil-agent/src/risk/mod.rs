//! Risk aggregation
//!
//! Combines the intensity class, scan verdict, stability report and domain
//! into a prompt, asks a text generator for a 0-100 safety score and reads
//! the score back out of free text. Assessment never fails: generator errors
//! and unparseable replies both yield score 0 with the default explanation.

pub mod generator;
pub mod parse;

use crate::jobs::ScanVerdict;
use crate::metrics::Intensity;
use crate::stability::{Stability, StabilityReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub use generator::{GeminiClient, GeneratorError, TextGenerator};
pub use parse::{parse_score, ParsedScore, DEFAULT_EXPLANATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyLevel {
    High,
    Medium,
    Low,
}

impl SafetyLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => SafetyLevel::High,
            50..=79 => SafetyLevel::Medium,
            _ => SafetyLevel::Low,
        }
    }
}

/// Scan evidence as far as the assessment is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scan", rename_all = "lowercase")]
pub enum ScanSignal {
    Clean,
    Flagged { reasons: Vec<String> },
    Unknown { reason: String },
}

impl From<ScanVerdict> for ScanSignal {
    fn from(verdict: ScanVerdict) -> Self {
        match verdict {
            ScanVerdict::Clean => ScanSignal::Clean,
            ScanVerdict::Flagged { reasons } => ScanSignal::Flagged { reasons },
        }
    }
}

impl fmt::Display for ScanSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanSignal::Clean => f.write_str("No malicious patterns were detected"),
            ScanSignal::Flagged { reasons } => write!(f, "Malicious patterns detected: {}", reasons.join("; ")),
            ScanSignal::Unknown { reason } => write!(f, "Scan unavailable ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    pub domain: String,
    pub intensity: Option<Intensity>,
    pub scan: ScanSignal,
    pub stability: Option<StabilityReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub domain: String,
    pub score: u8,
    pub safety: SafetyLevel,
    pub explanation: String,
    /// The score is the fallback value rather than a parsed one
    pub fallback: bool,
    pub inputs: RiskInputs,
    pub assessed_at: DateTime<Utc>,
}

fn stability_label(report: Option<&StabilityReport>, pick: fn(&StabilityReport) -> Stability) -> &'static str {
    match report.map(pick) {
        Some(Stability::Stable) => "Stable",
        Some(Stability::Unstable) => "Unstable",
        None => "Unknown",
    }
}

/// Builds the scoring prompt from the assessment inputs
pub fn build_prompt(inputs: &RiskInputs) -> String {
    let stability = inputs.stability.as_ref();
    let intensity = inputs
        .intensity
        .map_or_else(|| "Unknown".to_string(), |i| i.to_string());

    format!(
        "Based on the following data, assign a cybersecurity safety score from 0 to 100 \
         (where 100 is completely safe and 0 is highly unsafe).\n\n\
         Resource Intensity: {intensity}\n\
         System Resource Anomalies:\n\
         - CPU: {cpu}\n\
         - Memory Usage: {memory}\n\
         - Network Bytes Sent: {network}\n\
         Malicious Code Scan Result:\n\
         - {scan}\n\
         Domain Name:\n\
         - {domain}\n\n\
         Reply with the score alone on the first line, then one or two concise sentences \
         explaining why this website is safe or unsafe.",
        cpu = stability_label(stability, |r| r.cpu),
        memory = stability_label(stability, |r| r.memory),
        network = stability_label(stability, |r| r.network),
        scan = inputs.scan,
        domain = inputs.domain,
    )
}

pub struct RiskAggregator<G: TextGenerator> {
    generator: G,
}

impl<G: TextGenerator> RiskAggregator<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub async fn assess(&self, inputs: RiskInputs) -> RiskAssessment {
        let prompt = build_prompt(&inputs);
        debug!("Risk prompt for {}:\n{}", inputs.domain, prompt);

        let parsed = match self.generator.generate(&prompt).await {
            Ok(text) => {
                let parsed = parse_score(&text);
                if parsed.fallback {
                    warn!("No score in generator reply for {}: {:?}", inputs.domain, text);
                }
                parsed
            }
            Err(e) => {
                warn!("Risk generation failed for {}: {}", inputs.domain, e);
                ParsedScore::fallback()
            }
        };

        RiskAssessment {
            domain: inputs.domain.clone(),
            score: parsed.score,
            safety: SafetyLevel::from_score(parsed.score),
            explanation: parsed.explanation,
            fallback: parsed.fallback,
            inputs,
            assessed_at: Utc::now(),
        }
    }
}

/// Host part of a tab URL
pub fn domain_from_url(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(str::to_string)
}
