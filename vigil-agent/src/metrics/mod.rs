//! Telemetry metrics for monitored contexts
//!
//! Turns raw devtools counters into smoothed snapshots:
//! - Sampling of `Performance.getMetrics` on a fixed cadence (`sampler`)
//! - Exponential smoothing and CPU rate derivation (`smoothing`)
//! - Network byte accounting from devtools events (`network`)
//! - Resource intensity classification (`classifier`)

pub mod classifier;
pub mod network;
pub mod sampler;
pub mod smoothing;

use crate::devtools::ContextId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use classifier::{classify, Intensity};
pub use smoothing::SmoothingEngine;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cumulative counters as reported by one metrics read
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawCounters {
    /// Cumulative busy time of the context, in seconds
    pub task_duration_secs: f64,
    pub js_heap_used_bytes: f64,
    /// DOMContentLoaded minus navigation start, when both are reported
    pub load_time_ms: Option<f64>,
}

/// Smoothed telemetry produced once per sampling tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub context_id: ContextId,
    pub cpu_percent: f64,
    pub cpu_delta: f64,
    pub ram_mb: f64,
    pub ram_delta: f64,
    pub network_delta_bytes: u64,
    pub network_total_bytes: u64,
    /// Devtools events were dropped since monitoring started, so the network
    /// figures undercount
    #[serde(default)]
    pub network_incomplete: bool,
    pub load_time_ms: Option<f64>,
    pub intensity: Intensity,
    pub captured_at: DateTime<Utc>,
}

/// Mutable per-context telemetry state
#[derive(Debug, Clone, Default)]
pub struct TelemetrySession {
    pub(crate) smoothed_cpu: Option<f64>,
    pub(crate) smoothed_ram: Option<f64>,
    pub(crate) prev_task_duration: Option<f64>,
    pub(crate) prev_sample_at: Option<Instant>,
    pub(crate) network_total_bytes: u64,
    pub(crate) prev_network_total: u64,
    pub(crate) initial_load_bytes: Option<u64>,
    pub(crate) dropped_events: u64,
    pub(crate) last_snapshot: Option<Snapshot>,
}

impl TelemetrySession {
    pub fn smoothed_cpu(&self) -> Option<f64> {
        self.smoothed_cpu
    }

    pub fn smoothed_ram(&self) -> Option<f64> {
        self.smoothed_ram
    }

    pub fn network_total_bytes(&self) -> u64 {
        self.network_total_bytes
    }

    /// Network total when traffic was first seen, latched once
    pub fn initial_load_bytes(&self) -> Option<u64> {
        self.initial_load_bytes
    }

    /// Events lost while this session was live. The pump cannot tell which
    /// context a lost event belonged to, so every live session is charged.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }
}
