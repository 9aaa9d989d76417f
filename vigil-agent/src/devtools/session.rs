//! Session lifecycle for monitored contexts
//!
//! One session per context. Attach is idempotent and retried with a fixed
//! backoff up to a bounded number of attempts; overlapping callers share one
//! attempt through the session's attach gate. Detach cancels the session's
//! sampling timer before anything else.

use super::{Capability, ContextId, DevtoolsTransport, TransportError, PROTOCOL_VERSION};
use crate::metrics::TelemetrySession;
use crate::state::{new_registry, SharedMap};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retry policy for attaching to a context
#[derive(Debug, Clone, Copy)]
pub struct AttachPolicy {
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachState {
    Detached,
    Attaching,
    Attached,
    Failed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AttachError {
    #[error("attach to context {context} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        context: ContextId,
        attempts: u32,
        last_error: TransportError,
    },
    #[error("attach to context {0} was cancelled")]
    Cancelled(ContextId),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to enable {capability:?} on context {context}: {source}")]
pub struct CapabilityError {
    pub context: ContextId,
    pub capability: Capability,
    #[source]
    pub source: TransportError,
}

/// Live binding between the agent and one monitored context
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    context_id: ContextId,
    attach_state: Mutex<AttachState>,
    capabilities: Mutex<Vec<Capability>>,
    telemetry: Mutex<TelemetrySession>,
    sampling: AtomicBool,
    cancel: CancellationToken,
    /// Held for the whole retry loop; keeps the error of the last finished attempt
    attach_gate: tokio::sync::Mutex<Option<AttachError>>,
    /// Bumped each time an attempt finishes
    attach_generation: AtomicU64,
}

impl Session {
    fn new(context_id: ContextId) -> Self {
        Self {
            id: Uuid::new_v4(),
            context_id,
            attach_state: Mutex::new(AttachState::Detached),
            capabilities: Mutex::new(Vec::new()),
            telemetry: Mutex::new(TelemetrySession::default()),
            sampling: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            attach_gate: tokio::sync::Mutex::new(None),
            attach_generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn attach_state(&self) -> AttachState {
        *self.attach_state.lock()
    }

    fn set_state(&self, state: AttachState) {
        *self.attach_state.lock() = state;
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.lock().clone()
    }

    /// Runs `f` with exclusive access to the session's telemetry state
    pub fn with_telemetry<R>(&self, f: impl FnOnce(&mut TelemetrySession) -> R) -> R {
        f(&mut self.telemetry.lock())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns true only for the first caller, so one sampling loop runs per session
    pub(crate) fn claim_sampling(&self) -> bool {
        !self.sampling.swap(true, Ordering::SeqCst)
    }
}

/// Registry of sessions keyed by context
pub struct SessionManager<T: DevtoolsTransport> {
    transport: Arc<T>,
    sessions: SharedMap<ContextId, Arc<Session>>,
    policy: AttachPolicy,
}

impl<T: DevtoolsTransport> SessionManager<T> {
    pub fn new(transport: Arc<T>, policy: AttachPolicy) -> Self {
        Self {
            transport,
            sessions: new_registry(),
            policy,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn get(&self, context: ContextId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&context).cloned()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        let mut contexts: Vec<_> = self.sessions.lock().keys().copied().collect();
        contexts.sort();
        contexts
    }

    /// Attaches to `context`, reusing an already attached session
    pub async fn attach(&self, context: ContextId) -> Result<Arc<Session>, AttachError> {
        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(context)
                .or_insert_with(|| Arc::new(Session::new(context)))
                .clone();
            if session.attach_state() == AttachState::Attached {
                debug!("Context {} already attached (session {})", context, session.id());
                return Ok(session);
            }
            session
        };

        let observed = session.attach_generation.load(Ordering::SeqCst);
        let mut last_error = session.attach_gate.lock().await;
        if session.attach_state() == AttachState::Attached {
            debug!("Context {} attached by a concurrent caller", context);
            return Ok(Arc::clone(&session));
        }
        if session.attach_generation.load(Ordering::SeqCst) != observed {
            // The attempt we waited on failed; report it instead of starting another
            if let Some(e) = last_error.clone() {
                return Err(e);
            }
        }

        let outcome = self.connect(&session).await;
        *last_error = outcome.as_ref().err().cloned();
        session.attach_generation.fetch_add(1, Ordering::SeqCst);
        drop(last_error);
        outcome.map(|()| session)
    }

    async fn connect(&self, session: &Session) -> Result<(), AttachError> {
        let context = session.context_id();
        let max_attempts = self.policy.max_attempts.max(1);
        session.set_state(AttachState::Attaching);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.attach(context, PROTOCOL_VERSION).await {
                Ok(()) => {
                    session.set_state(AttachState::Attached);
                    info!("Attached to context {} (session {})", context, session.id());
                    return Ok(());
                }
                Err(TransportError::AlreadyAttached(_)) => {
                    warn!("Another debugger is already attached to context {}. Proceeding.", context);
                    session.set_state(AttachState::Attached);
                    return Ok(());
                }
                Err(e) if attempt >= max_attempts => {
                    session.set_state(AttachState::Failed);
                    return Err(AttachError::Exhausted {
                        context,
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Attach to context {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        context, attempt, max_attempts, e, self.policy.backoff
                    );
                    tokio::select! {
                        _ = session.cancel.cancelled() => {
                            session.set_state(AttachState::Detached);
                            return Err(AttachError::Cancelled(context));
                        }
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                    }
                }
            }
        }
    }

    /// Enables a capability domain and remembers it for re-attach
    pub async fn enable_capability(
        &self,
        session: &Session,
        capability: Capability,
    ) -> Result<(), CapabilityError> {
        let context = session.context_id();
        self.transport
            .send_command(context, capability.enable_method(), json!({}))
            .await
            .map_err(|source| CapabilityError {
                context,
                capability,
                source,
            })?;

        let mut enabled = session.capabilities.lock();
        if !enabled.contains(&capability) {
            enabled.push(capability);
        }
        debug!("Enabled {:?} on context {}", capability, context);
        Ok(())
    }

    /// Tears a session down. Never fails; the transport detach is best effort.
    pub async fn detach(&self, session: &Session) {
        self.retire(session);
        self.unbind(session).await;
    }

    /// Cancels the session's timers and drops it from the registry without
    /// touching the transport
    pub fn retire(&self, session: &Session) {
        let context = session.context_id();
        session.cancel.cancel();

        let mut sessions = self.sessions.lock();
        if sessions.get(&context).map(|s| s.id()) == Some(session.id()) {
            sessions.remove(&context);
        }
    }

    /// Best-effort transport detach of a retired session
    pub async fn unbind(&self, session: &Session) {
        let context = session.context_id();
        if let Err(e) = self.transport.detach(context).await {
            debug!("Detach from context {} failed (ignored): {}", context, e);
        }
        session.set_state(AttachState::Detached);
        info!("Detached from context {} (session {})", context, session.id());
    }

    /// Detaches the session bound to `context`, if any
    pub async fn close_context(&self, context: ContextId) {
        if let Some(session) = self.get(context) {
            self.detach(&session).await;
        }
    }

    /// Re-establishes the binding after a failed sample and re-enables capabilities
    pub async fn reattach(&self, session: &Session) -> Result<(), AttachError> {
        let context = session.context_id();
        if session.is_closed() {
            return Err(AttachError::Cancelled(context));
        }

        {
            let mut last_error = session.attach_gate.lock().await;
            if let Err(e) = self.transport.detach(context).await {
                debug!("Pre-reattach detach from context {} failed (ignored): {}", context, e);
            }
            session.set_state(AttachState::Detached);
            let outcome = self.connect(session).await;
            *last_error = outcome.as_ref().err().cloned();
            session.attach_generation.fetch_add(1, Ordering::SeqCst);
            outcome?;
        }

        for capability in session.capabilities() {
            if let Err(e) = self.enable_capability(session, capability).await {
                warn!("{} - continuing without it", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devtools::{ContextLifecycle, DevtoolsEvent};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    /// Transport that fails the first `failures` attaches with `error`
    struct FlakyTransport {
        failures: Mutex<u32>,
        error: TransportError,
        attach_calls: Mutex<u32>,
        detach_calls: Mutex<u32>,
        commands: Mutex<Vec<String>>,
        events: broadcast::Sender<DevtoolsEvent>,
        lifecycle: broadcast::Sender<ContextLifecycle>,
    }

    impl FlakyTransport {
        fn new(failures: u32, error: TransportError) -> Self {
            Self {
                failures: Mutex::new(failures),
                error,
                attach_calls: Mutex::new(0),
                detach_calls: Mutex::new(0),
                commands: Mutex::new(Vec::new()),
                events: broadcast::channel(8).0,
                lifecycle: broadcast::channel(8).0,
            }
        }
    }

    #[async_trait]
    impl DevtoolsTransport for FlakyTransport {
        async fn attach(&self, _context: ContextId, version: &str) -> Result<(), TransportError> {
            assert_eq!(version, "1.3");
            *self.attach_calls.lock() += 1;
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(self.error.clone());
            }
            Ok(())
        }

        async fn detach(&self, context: ContextId) -> Result<(), TransportError> {
            *self.detach_calls.lock() += 1;
            Err(TransportError::NotAttached(context))
        }

        async fn send_command(
            &self,
            _context: ContextId,
            method: &str,
            _params: Value,
        ) -> Result<Value, TransportError> {
            self.commands.lock().push(method.to_string());
            Ok(json!({}))
        }

        fn events(&self) -> broadcast::Receiver<DevtoolsEvent> {
            self.events.subscribe()
        }

        fn lifecycle(&self) -> broadcast::Receiver<ContextLifecycle> {
            self.lifecycle.subscribe()
        }
    }

    fn manager(failures: u32, max_attempts: u32) -> SessionManager<FlakyTransport> {
        let transport = Arc::new(FlakyTransport::new(
            failures,
            TransportError::Unavailable("tab busy".into()),
        ));
        SessionManager::new(
            transport,
            AttachPolicy {
                backoff: Duration::from_secs(2),
                max_attempts,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_is_idempotent() {
        let manager = manager(0, 3);
        let first = manager.attach(ContextId(1)).await.unwrap();
        let second = manager.attach(ContextId(1)).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(*manager.transport().attach_calls.lock(), 1);
        assert_eq!(manager.contexts(), vec![ContextId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_retries_with_backoff() {
        let manager = manager(2, 5);
        let started = tokio::time::Instant::now();

        let session = manager.attach(ContextId(4)).await.unwrap();

        assert_eq!(session.attach_state(), AttachState::Attached);
        assert_eq!(*manager.transport().attach_calls.lock(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_millis(4050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_gives_up_after_max_attempts() {
        let manager = manager(10, 3);

        let err = manager.attach(ContextId(9)).await.unwrap_err();

        match err {
            AttachError::Exhausted { attempts, context, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(context, ContextId(9));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.get(ContextId(9)).unwrap().attach_state(), AttachState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_attached_counts_as_success() {
        let transport = Arc::new(FlakyTransport::new(1, TransportError::AlreadyAttached(ContextId(2))));
        let manager = SessionManager::new(transport, AttachPolicy::default());

        let session = manager.attach(ContextId(2)).await.unwrap();

        assert_eq!(session.attach_state(), AttachState::Attached);
        assert_eq!(*manager.transport().attach_calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_is_best_effort_and_cancels() {
        let manager = manager(0, 1);
        let session = manager.attach(ContextId(3)).await.unwrap();
        let token = session.cancel_token();

        manager.detach(&session).await;

        assert!(token.is_cancelled());
        assert_eq!(session.attach_state(), AttachState::Detached);
        assert!(manager.get(ContextId(3)).is_none());
        assert!(matches!(manager.reattach(&session).await, Err(AttachError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_reenables_capabilities() {
        let manager = manager(0, 2);
        let session = manager.attach(ContextId(5)).await.unwrap();
        manager.enable_capability(&session, Capability::Performance).await.unwrap();
        manager.enable_capability(&session, Capability::Network).await.unwrap();

        manager.reattach(&session).await.unwrap();

        assert_eq!(
            *manager.transport().commands.lock(),
            vec!["Performance.enable", "Network.enable", "Performance.enable", "Network.enable"]
        );
        assert_eq!(*manager.transport().attach_calls.lock(), 2);
        assert_eq!(session.capabilities().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_attaches_share_one_retry_loop() {
        let manager = manager(2, 5);

        let (first, second) = tokio::join!(manager.attach(ContextId(6)), manager.attach(ContextId(6)));

        assert_eq!(first.unwrap().id(), second.unwrap().id());
        assert_eq!(*manager.transport().attach_calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_attaches_share_exhaustion() {
        let manager = manager(10, 3);

        let (first, second) = tokio::join!(manager.attach(ContextId(7)), manager.attach(ContextId(7)));

        assert!(matches!(first, Err(AttachError::Exhausted { attempts: 3, .. })));
        assert!(matches!(second, Err(AttachError::Exhausted { attempts: 3, .. })));
        assert_eq!(*manager.transport().attach_calls.lock(), 3);

        // A later call is a fresh attempt
        assert!(manager.attach(ContextId(7)).await.is_err());
        assert_eq!(*manager.transport().attach_calls.lock(), 6);
    }

    #[test]
    fn test_sampling_claimed_once() {
        let session = Session::new(ContextId(1));
        assert!(session.claim_sampling());
        assert!(!session.claim_sampling());
    }
}
