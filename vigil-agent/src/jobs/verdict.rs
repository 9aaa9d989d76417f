//! Clean/flagged verdicts from worker results
//!
//! Workers report free text. A page scan or antivirus run is clean only when
//! its output carries one of the known "nothing found" phrases.

use super::JobKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CLEAN_MARKERS: &[&str] = &["no malicious pattern", "no virus found"];
const YARA_PLACEHOLDERS: &[&str] = &["no matches", "no yara rules loaded."];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum ScanVerdict {
    Clean,
    Flagged { reasons: Vec<String> },
}

impl ScanVerdict {
    fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            ScanVerdict::Clean
        } else {
            ScanVerdict::Flagged { reasons }
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ScanVerdict::Clean)
    }
}

pub fn output_is_clean(output: &str) -> bool {
    let lowered = output.to_lowercase();
    CLEAN_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn extract_verdict(kind: JobKind, result: &Value) -> ScanVerdict {
    // Some workers wrap the payload in a one-element list
    let entry = match result {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    };

    if let Some(error) = entry.get("error").and_then(Value::as_str) {
        return ScanVerdict::Flagged {
            reasons: vec![format!("worker error: {error}")],
        };
    }

    match kind {
        JobKind::PageScan => page_scan_verdict(entry),
        JobKind::Analyze => analysis_verdict(entry),
        JobKind::BehavioralTest => behavior_verdict(entry),
    }
}

fn page_scan_verdict(entry: &Value) -> ScanVerdict {
    let output = entry
        .get("output")
        .and_then(Value::as_str)
        .or_else(|| entry.as_str())
        .unwrap_or_default();

    if output_is_clean(output) {
        ScanVerdict::Clean
    } else if output.trim().is_empty() {
        ScanVerdict::from_reasons(vec!["page scan produced no output".into()])
    } else {
        ScanVerdict::from_reasons(vec![format!("page scan: {}", output.trim())])
    }
}

fn analysis_verdict(entry: &Value) -> ScanVerdict {
    let mut reasons = Vec::new();

    let clamav = entry.get("clamav_scan").and_then(Value::as_str).unwrap_or_default();
    if !output_is_clean(clamav) {
        let detail = if clamav.trim().is_empty() { "no scan output" } else { clamav.trim() };
        reasons.push(format!("clamav: {detail}"));
    }

    let matches: Vec<&str> = match entry.get("yara_matches") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(single)) => vec![single.as_str()],
        _ => Vec::new(),
    };
    for rule in matches {
        let lowered = rule.to_lowercase();
        if YARA_PLACEHOLDERS.contains(&lowered.as_str()) || lowered.starts_with("yara scan error") {
            continue;
        }
        reasons.push(format!("yara: {rule}"));
    }

    ScanVerdict::from_reasons(reasons)
}

/// Every array-valued key is a metric series; a row flags on `is_outlier`
/// alone, `z_score` is detail when present.
fn behavior_verdict(entry: &Value) -> ScanVerdict {
    let Some(series) = entry.as_object() else {
        return ScanVerdict::Clean;
    };

    let mut reasons = Vec::new();
    for (metric, rows) in series {
        let Some(rows) = rows.as_array() else {
            continue;
        };
        let outliers: Vec<&Value> = rows
            .iter()
            .filter(|row| row.get("is_outlier").and_then(Value::as_bool).unwrap_or(false))
            .collect();
        if outliers.is_empty() {
            continue;
        }
        let peak = outliers
            .iter()
            .filter_map(|row| row.get("z_score").and_then(Value::as_f64))
            .map(f64::abs)
            .reduce(f64::max);
        reasons.push(match peak {
            Some(peak) => format!("{metric}: {} outlier(s), peak |z| {:.2}", outliers.len(), peak),
            None => format!("{metric}: {} outlier(s)", outliers.len()),
        });
    }
    ScanVerdict::from_reasons(reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_scan_marker() {
        let clean = json!({ "message": "Scan completed", "output": "No malicious patterns were detected." });
        let dirty = json!({ "message": "Scan completed", "output": "Suspicious_Eval matched at line 12" });

        assert_eq!(extract_verdict(JobKind::PageScan, &clean), ScanVerdict::Clean);
        assert!(!extract_verdict(JobKind::PageScan, &dirty).is_clean());
        assert!(!extract_verdict(JobKind::PageScan, &json!({})).is_clean());
    }

    #[test]
    fn test_analysis_placeholders_are_clean() {
        let result = json!([{
            "clamav_scan": "No virus found by ClamAV",
            "yara_matches": ["No matches"],
            "suspicion_level": "Low"
        }]);
        assert_eq!(extract_verdict(JobKind::Analyze, &result), ScanVerdict::Clean);
    }

    #[test]
    fn test_analysis_flags_matches() {
        let result = json!({
            "clamav_scan": "Win.Trojan.Agent FOUND",
            "yara_matches": ["Suspicious_PowerShell", "No matches"]
        });

        match extract_verdict(JobKind::Analyze, &result) {
            ScanVerdict::Flagged { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[1].contains("Suspicious_PowerShell"));
            }
            ScanVerdict::Clean => panic!("expected flagged verdict"),
        }
    }

    #[test]
    fn test_behavior_outliers() {
        let calm = json!({
            "cpu": [{ "value": 1.0, "z_score": 0.3, "is_outlier": false }],
            "memory": [{ "value": 2.0, "z_score": -0.1, "is_outlier": false }]
        });
        let spiky = json!({
            "cpu": [
                { "value": 90.0, "z_score": 3.4, "is_outlier": true },
                { "value": 1.0, "z_score": -3.9, "is_outlier": true }
            ]
        });

        assert!(extract_verdict(JobKind::BehavioralTest, &calm).is_clean());
        match extract_verdict(JobKind::BehavioralTest, &spiky) {
            ScanVerdict::Flagged { reasons } => assert_eq!(reasons, vec!["cpu: 2 outlier(s), peak |z| 3.90"]),
            ScanVerdict::Clean => panic!("expected flagged verdict"),
        }
    }

    #[test]
    fn test_behavior_checks_every_worker_series() {
        let result = json!([{
            "cpu": [{ "value": 12.0, "z_score": 0.2, "is_outlier": false }],
            "memory": [{ "value": 18.0, "z_score": -0.4, "is_outlier": false }],
            "bytes_sent": [{ "value": 2.0e8, "z_score": 8.0, "is_outlier": true }],
            "bytes_recv": [{ "value": 9.0e7, "is_outlier": true }],
            "load": [{ "value": 40.0, "is_outlier": true }]
        }]);

        match extract_verdict(JobKind::BehavioralTest, &result) {
            ScanVerdict::Flagged { reasons } => assert_eq!(
                reasons,
                vec![
                    "bytes_recv: 1 outlier(s)",
                    "bytes_sent: 1 outlier(s), peak |z| 8.00",
                    "load: 1 outlier(s)",
                ]
            ),
            ScanVerdict::Clean => panic!("expected flagged verdict"),
        }
    }

    #[test]
    fn test_short_page_scan_marker_is_clean() {
        let result = json!({ "output": "No malicious patterns detected." });
        assert_eq!(extract_verdict(JobKind::PageScan, &result), ScanVerdict::Clean);
    }

    #[test]
    fn test_worker_error_is_flagged() {
        let verdict = extract_verdict(JobKind::PageScan, &json!({ "error": "Scan script failed" }));
        assert!(!verdict.is_clean());
    }
}
