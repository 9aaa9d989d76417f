//! Periodic metrics sampling for one session
//!
//! Each tick reads `Performance.getMetrics`, folds the counters through the
//! smoothing engine and publishes the snapshot. A failed read skips the tick
//! and triggers a re-attach; the loop only ends when the session is closed.

use super::{RawCounters, Snapshot, SmoothingEngine};
use crate::devtools::{methods, ContextId, DevtoolsTransport, Session, SessionManager, TransportError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("metrics read failed on context {context}: {source}")]
    Command {
        context: ContextId,
        #[source]
        source: TransportError,
    },
    #[error("malformed metrics payload from context {context}: {reason}")]
    Malformed { context: ContextId, reason: String },
}

/// Extracts the counters of interest from a `Performance.getMetrics` result
pub fn parse_metrics(result: &Value) -> Result<RawCounters, String> {
    let metrics = result
        .get("metrics")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing metrics array".to_string())?;

    let lookup = |name: &str| {
        metrics
            .iter()
            .find(|m| m.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|m| m.get("value"))
            .and_then(Value::as_f64)
    };

    let load_time_ms = match (lookup("DomContentLoaded"), lookup("NavigationStart")) {
        (Some(loaded), Some(start)) if loaded >= start && start > 0.0 => Some((loaded - start) * 1000.0),
        _ => None,
    };

    Ok(RawCounters {
        task_duration_secs: lookup("TaskDuration").unwrap_or(0.0),
        js_heap_used_bytes: lookup("JSHeapUsedSize").unwrap_or(0.0),
        load_time_ms,
    })
}

/// Reads the current counters of a session's context
pub async fn sample<T: DevtoolsTransport + ?Sized>(
    transport: &T,
    session: &Session,
) -> Result<RawCounters, SampleError> {
    let context = session.context_id();
    let result = transport
        .send_command(context, methods::PERFORMANCE_GET_METRICS, json!({}))
        .await
        .map_err(|source| SampleError::Command { context, source })?;
    parse_metrics(&result).map_err(|reason| SampleError::Malformed { context, reason })
}

/// Samples `session` every `interval` until its cancellation token fires
pub async fn run_sampling_loop<T: DevtoolsTransport>(
    manager: Arc<SessionManager<T>>,
    session: Arc<Session>,
    engine: SmoothingEngine,
    interval: Duration,
    snapshots: broadcast::Sender<Snapshot>,
) {
    let context = session.context_id();
    let cancel = session.cancel_token();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!("Sampling loop started for context {} every {:?}", context, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = sample(manager.transport().as_ref(), &session) => outcome,
        };

        match outcome {
            Ok(raw) => {
                let snapshot = session.with_telemetry(|t| engine.apply(t, context, raw, Instant::now()));
                debug!(
                    "Context {}: cpu {:.1}% ram {:.1}MB net +{}B ({})",
                    context,
                    snapshot.cpu_percent,
                    snapshot.ram_mb,
                    snapshot.network_delta_bytes,
                    snapshot.intensity
                );
                // Nobody listening is not an error
                let _ = snapshots.send(snapshot);
            }
            Err(e) => {
                warn!("{}. Re-attaching", e);
                if let Err(e) = manager.reattach(&session).await {
                    error!("Re-attach failed: {}", e);
                }
            }
        }
    }
    debug!("Sampling loop stopped for context {}", context);
}
