use serde::{Deserialize, Serialize};
use std::fmt;

pub const CPU_THRESHOLD_PERCENT: f64 = 40.0;
pub const RAM_THRESHOLD_MB: f64 = 30.0;
pub const LOAD_TIME_THRESHOLD_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Intensity::Low => "Low",
            Intensity::Medium => "Medium",
            Intensity::High => "High",
        };
        f.write_str(label)
    }
}

/// Number of metrics strictly above their threshold. A missing load time never breaches.
pub fn breach_count(cpu_percent: f64, ram_mb: f64, load_time_ms: Option<f64>) -> u8 {
    u8::from(cpu_percent > CPU_THRESHOLD_PERCENT)
        + u8::from(ram_mb > RAM_THRESHOLD_MB)
        + u8::from(load_time_ms.is_some_and(|ms| ms > LOAD_TIME_THRESHOLD_MS))
}

pub fn classify(cpu_percent: f64, ram_mb: f64, load_time_ms: Option<f64>) -> Intensity {
    match breach_count(cpu_percent, ram_mb, load_time_ms) {
        0 => Intensity::Low,
        1 => Intensity::Medium,
        _ => Intensity::High,
    }
}
