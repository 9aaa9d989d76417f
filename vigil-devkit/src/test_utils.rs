/*!
Test harness for the Vigil agent

Wires a `Monitor` to the in-memory devtools transport with a fast sampling
cadence and short attach backoff, plus helpers to wait for snapshots.
*/

use crate::devtools_stub::MockDevtools;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use vigil_agent::devtools::AttachPolicy;
use vigil_agent::metrics::Snapshot;
use vigil_agent::{ContextId, Monitor, MonitorSettings};

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
pub const ATTACH_BACKOFF: Duration = Duration::from_millis(50);

pub struct TestHarness {
    pub devtools: Arc<MockDevtools>,
    pub monitor: Arc<Monitor<MockDevtools>>,
    snapshots: broadcast::Receiver<Snapshot>,
    event_pump: JoinHandle<()>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(Self::fast_settings())
    }

    /// Fast sampling cadence and short attach backoff
    pub fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            sample_interval: SAMPLE_INTERVAL,
            alpha: 0.3,
            attach: AttachPolicy {
                backoff: ATTACH_BACKOFF,
                max_attempts: 5,
            },
        }
    }

    /// Must be called inside a tokio runtime
    pub fn with_settings(settings: MonitorSettings) -> Self {
        Self::with_devtools(MockDevtools::new(), settings)
    }

    pub fn with_devtools(devtools: MockDevtools, settings: MonitorSettings) -> Self {
        env_logger::try_init().ok();

        let devtools = Arc::new(devtools);
        let monitor = Arc::new(Monitor::new(Arc::clone(&devtools), settings));
        let snapshots = monitor.subscribe();
        let event_pump = monitor.spawn_event_pump();

        Self {
            devtools,
            monitor,
            snapshots,
            event_pump,
        }
    }

    /// Next snapshot for `context`, skipping other contexts
    pub async fn next_snapshot(&mut self, context: ContextId, wait: Duration) -> Result<Snapshot> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let snapshot = tokio::time::timeout_at(deadline, self.snapshots.recv())
                .await
                .map_err(|_| anyhow::anyhow!("no snapshot for context {} within {:?}", context, wait))??;
            if snapshot.context_id == context {
                log::debug!("📊 Snapshot for {}: cpu {:.1}%", context, snapshot.cpu_percent);
                return Ok(snapshot);
            }
        }
    }

    /// Collects `count` consecutive snapshots for `context`
    pub async fn collect_snapshots(&mut self, context: ContextId, count: usize, wait: Duration) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::with_capacity(count);
        for _ in 0..count {
            snapshots.push(self.next_snapshot(context, wait).await?);
        }
        Ok(snapshots)
    }

    /// Lets spawned tasks (event pump, sampling loops) drain their queues
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.event_pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devtools_stub::MetricsReading;

    #[tokio::test(start_paused = true)]
    async fn test_harness_produces_snapshots() {
        let mut harness = TestHarness::new();
        let ctx = ContextId(1);
        harness.devtools.script_metrics(ctx, [MetricsReading::new(0.0, 12.0)]);

        harness.monitor.watch(ctx).await.unwrap();
        let snapshot = harness.next_snapshot(ctx, Duration::from_secs(1)).await.unwrap();

        assert_eq!(snapshot.context_id, ctx);
        assert!((snapshot.ram_mb - 12.0).abs() < 1e-9);
    }
}
