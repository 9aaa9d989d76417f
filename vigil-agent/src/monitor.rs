//! Context monitoring front door
//!
//! `watch` attaches to a context, enables the performance and network domains
//! and starts its sampling loop. `close` tears everything down, `release` does
//! the same without waiting on the transport. The event pump routes devtools
//! events to the session of the context they came from.

use crate::devtools::{AttachError, AttachPolicy, Capability, ContextId, DevtoolsTransport, Session, SessionManager};
use crate::metrics::sampler::run_sampling_loop;
use crate::metrics::{network, Snapshot, SmoothingEngine};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub sample_interval: Duration,
    pub alpha: f64,
    pub attach: AttachPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            alpha: crate::metrics::smoothing::DEFAULT_ALPHA,
            attach: AttachPolicy::default(),
        }
    }
}

pub struct Monitor<T: DevtoolsTransport> {
    manager: Arc<SessionManager<T>>,
    engine: SmoothingEngine,
    sample_interval: Duration,
    snapshots: broadcast::Sender<Snapshot>,
    dropped_events: Arc<AtomicU64>,
}

impl<T: DevtoolsTransport> Monitor<T> {
    pub fn new(transport: Arc<T>, settings: MonitorSettings) -> Self {
        Self {
            manager: Arc::new(SessionManager::new(transport, settings.attach)),
            engine: SmoothingEngine::new(settings.alpha),
            sample_interval: settings.sample_interval,
            snapshots: broadcast::channel(256).0,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager<T>> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Starts monitoring a context. Watching an already monitored context is a no-op.
    pub async fn watch(&self, context: ContextId) -> Result<Arc<Session>, AttachError> {
        let session = self.manager.attach(context).await?;

        if session.claim_sampling() {
            for capability in [Capability::Performance, Capability::Network] {
                if let Err(e) = self.manager.enable_capability(&session, capability).await {
                    warn!("{} - continuing in degraded mode", e);
                }
            }

            tokio::spawn(run_sampling_loop(
                Arc::clone(&self.manager),
                Arc::clone(&session),
                self.engine,
                self.sample_interval,
                self.snapshots.clone(),
            ));
            info!("Monitoring context {} (session {})", context, session.id());
        }
        Ok(session)
    }

    pub async fn close(&self, context: ContextId) {
        self.manager.close_context(context).await;
    }

    /// Stops sampling `context` immediately; the transport detach runs in the background
    pub fn release(&self, context: ContextId) -> Option<JoinHandle<()>> {
        let session = self.manager.get(context)?;
        self.manager.retire(&session);

        let manager = Arc::clone(&self.manager);
        Some(tokio::spawn(async move { manager.unbind(&session).await }))
    }

    /// Devtools events the pump lost to a full buffer
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Most recent snapshot of a monitored context
    pub fn latest(&self, context: ContextId) -> Option<Snapshot> {
        self.manager
            .get(context)
            .and_then(|session| session.with_telemetry(|t| t.last_snapshot().cloned()))
    }

    /// Routes transport events into session accumulators until the transport closes
    pub fn spawn_event_pump(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let dropped_events = Arc::clone(&self.dropped_events);
        let mut events = manager.transport().events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match manager.get(event.context_id) {
                        Some(session) => {
                            network::ingest(&session, &event);
                        }
                        None => debug!("Event {} for unmonitored context {}", event.method, event.context_id),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event pump lagged, {} devtools events dropped", skipped);
                        dropped_events.fetch_add(skipped, Ordering::Relaxed);
                        for context in manager.contexts() {
                            if let Some(session) = manager.get(context) {
                                session.with_telemetry(|t| t.dropped_events += skipped);
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
