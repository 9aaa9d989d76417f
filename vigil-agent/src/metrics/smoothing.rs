use super::{classify, RawCounters, Snapshot, TelemetrySession, BYTES_PER_MB};
use crate::devtools::ContextId;
use chrono::Utc;
use tokio::time::Instant;

pub const DEFAULT_ALPHA: f64 = 0.3;

/// Exponential moving average step. The first value passes through unchanged.
pub fn smooth(alpha: f64, value: f64, previous: Option<f64>) -> f64 {
    match previous {
        Some(prev) => alpha * value + (1.0 - alpha) * prev,
        None => value,
    }
}

/// CPU usage percentage from two cumulative busy-time readings.
///
/// Returns 0 on the first reading or when no time elapsed.
pub fn cpu_percent(previous: Option<(f64, Instant)>, task_duration_secs: f64, at: Instant) -> f64 {
    let Some((prev_duration, prev_at)) = previous else {
        return 0.0;
    };
    let elapsed = at.saturating_duration_since(prev_at);
    if elapsed.is_zero() {
        return 0.0;
    }
    ((task_duration_secs - prev_duration) / elapsed.as_secs_f64() * 100.0).max(0.0)
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothingEngine {
    alpha: f64,
}

impl Default for SmoothingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl SmoothingEngine {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Folds one metrics read into the session and returns the resulting snapshot.
    ///
    /// `at` is the monotonic read time used for the CPU rate. Consumes the
    /// network delta accumulated since the previous tick.
    pub fn apply(
        &self,
        session: &mut TelemetrySession,
        context_id: ContextId,
        raw: RawCounters,
        at: Instant,
    ) -> Snapshot {
        let measured_cpu = cpu_percent(
            session.prev_task_duration.zip(session.prev_sample_at),
            raw.task_duration_secs,
            at,
        );
        session.prev_task_duration = Some(raw.task_duration_secs);
        session.prev_sample_at = Some(at);

        let prev_cpu = session.smoothed_cpu;
        let cpu = smooth(self.alpha, measured_cpu, prev_cpu);
        session.smoothed_cpu = Some(cpu);

        let prev_ram = session.smoothed_ram;
        let ram = smooth(self.alpha, raw.js_heap_used_bytes / BYTES_PER_MB, prev_ram);
        session.smoothed_ram = Some(ram);

        // CPU delta only reports increases, RAM delta keeps its sign
        let cpu_delta = prev_cpu.map_or(0.0, |prev| (cpu - prev).max(0.0));
        let ram_delta = prev_ram.map_or(0.0, |prev| ram - prev);
        let network_delta_bytes = session.take_network_delta();

        let snapshot = Snapshot {
            context_id,
            cpu_percent: cpu,
            cpu_delta,
            ram_mb: ram,
            ram_delta,
            network_delta_bytes,
            network_total_bytes: session.network_total_bytes,
            network_incomplete: session.dropped_events > 0,
            load_time_ms: raw.load_time_ms,
            intensity: classify(cpu, ram, raw.load_time_ms),
            captured_at: Utc::now(),
        };
        session.last_snapshot = Some(snapshot.clone());
        snapshot
    }
}
