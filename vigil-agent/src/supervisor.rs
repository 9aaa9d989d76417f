//! Tab lifecycle supervision
//!
//! Turns context open/close notifications into monitoring sessions and one
//! assessment per opened tab. The most recently opened tab is the active one;
//! its deltas are what `report_stability` sends to the stability service.

use crate::assessment::{is_restricted, Assessor};
use crate::devtools::{ContextId, ContextLifecycle, DevtoolsTransport};
use crate::jobs::JobService;
use crate::monitor::Monitor;
use crate::risk::{RiskAssessment, TextGenerator};
use crate::stability::{DeltaRow, StabilityService};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Assessment of one opened tab (matches vigil/agent/assessment@v1)
#[derive(Debug, Clone, Serialize)]
pub struct TabAssessment {
    pub context_id: ContextId,
    pub url: String,
    pub assessment: RiskAssessment,
    pub timestamp: DateTime<Utc>,
}

pub struct TabSupervisor<T, S, St, G>
where
    T: DevtoolsTransport,
    S: JobService,
    St: StabilityService,
    G: TextGenerator,
{
    monitor: Arc<Monitor<T>>,
    assessor: Arc<Assessor<S, St, G>>,
    /// Wait between attaching and assessing so the first snapshots land
    settle: Duration,
    assessments: broadcast::Sender<TabAssessment>,
    active_context: Mutex<Option<ContextId>>,
}

impl<T, S, St, G> TabSupervisor<T, S, St, G>
where
    T: DevtoolsTransport,
    S: JobService + 'static,
    St: StabilityService + 'static,
    G: TextGenerator + 'static,
{
    pub fn new(monitor: Arc<Monitor<T>>, assessor: Arc<Assessor<S, St, G>>, settle: Duration) -> Self {
        Self {
            monitor,
            assessor,
            settle,
            assessments: broadcast::channel(64).0,
            active_context: Mutex::new(None),
        }
    }

    pub fn monitor(&self) -> &Arc<Monitor<T>> {
        &self.monitor
    }

    pub fn assessor(&self) -> &Arc<Assessor<S, St, G>> {
        &self.assessor
    }

    pub fn subscribe_assessments(&self) -> broadcast::Receiver<TabAssessment> {
        self.assessments.subscribe()
    }

    pub fn active_context(&self) -> Option<ContextId> {
        *self.active_context.lock()
    }

    /// Follows the transport's lifecycle notifications until it closes
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut lifecycle = self.monitor.manager().transport().lifecycle();
        tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(notification) => supervisor.on_lifecycle(notification),
                    Err(RecvError::Lagged(skipped)) => warn!("Missed {} lifecycle notifications", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn on_lifecycle(&self, notification: ContextLifecycle) {
        match notification {
            ContextLifecycle::Opened { context_id, url } => self.on_context_opened(context_id, url),
            ContextLifecycle::Closed { context_id } => self.on_context_closed(context_id),
        }
    }

    /// Starts monitoring the tab and schedules its assessment
    pub fn on_context_opened(&self, context_id: ContextId, url: Option<String>) {
        let Some(url) = url else {
            debug!("Context {} opened without a URL, waiting for navigation", context_id);
            return;
        };
        if is_restricted(&url) {
            info!("Skipping restricted context {} ({})", context_id, url);
            return;
        }
        *self.active_context.lock() = Some(context_id);

        let monitor = Arc::clone(&self.monitor);
        let assessor = Arc::clone(&self.assessor);
        let assessments = self.assessments.clone();
        let settle = self.settle;
        tokio::spawn(async move {
            if let Err(e) = monitor.watch(context_id).await {
                error!("Cannot monitor context {}: {}", context_id, e);
                return;
            }
            tokio::time::sleep(settle).await;

            let snapshot = monitor.latest(context_id);
            let assessment = assessor.assess(&url, snapshot.as_ref()).await;
            if assessments
                .send(TabAssessment {
                    context_id,
                    url,
                    assessment,
                    timestamp: Utc::now(),
                })
                .is_err()
            {
                debug!("No listener for the assessment of context {}", context_id);
            }
        });
    }

    /// Stops sampling right away; the transport detach finishes in the background
    pub fn on_context_closed(&self, context_id: ContextId) {
        {
            let mut active = self.active_context.lock();
            if *active == Some(context_id) {
                *active = None;
            }
        }
        self.monitor.release(context_id);
    }

    /// Pushes the active tab's latest deltas and refreshes the stability report
    pub fn report_stability(&self) -> Option<JoinHandle<()>> {
        let snapshot = self.active_context().and_then(|context| self.monitor.latest(context))?;
        let assessor = Arc::clone(&self.assessor);
        Some(tokio::spawn(async move {
            let stability = assessor.stability();
            if let Err(e) = stability.submit_row(&DeltaRow::from_snapshot(&snapshot)).await {
                warn!("Stability row rejected: {}", e);
                return;
            }
            match stability.latest().await {
                Ok(Some(report)) if !report.is_stable() => {
                    info!("Context {} unstable: {:?}", snapshot.context_id, report.unstable_metrics())
                }
                Ok(_) => debug!("Context {} stable", snapshot.context_id),
                Err(e) => warn!("Stability report unavailable: {}", e),
            }
        }))
    }

    /// Tears down every monitored context
    pub async fn shutdown(&self) {
        for context in self.monitor.manager().contexts() {
            self.monitor.close(context).await;
        }
    }
}
