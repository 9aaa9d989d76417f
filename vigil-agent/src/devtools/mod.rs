//! Devtools instrumentation layer for Vigil agents
//!
//! Provides the binding between the agent and a monitored browser context:
//! - Transport abstraction (attach, detach, commands, event stream)
//! - Protocol constants (version, command and event names)
//! - Session lifecycle management with bounded re-attach (`session`)
//! - MQTT bridge transport to the browser-side relay (`bridge`)

pub mod bridge;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

pub use session::{AttachError, AttachPolicy, AttachState, CapabilityError, Session, SessionManager};

/// Protocol version requested on every attach
pub const PROTOCOL_VERSION: &str = "1.3";

/// Devtools method names used by the agent
pub mod methods {
    pub const PERFORMANCE_ENABLE: &str = "Performance.enable";
    pub const NETWORK_ENABLE: &str = "Network.enable";
    pub const PERFORMANCE_GET_METRICS: &str = "Performance.getMetrics";
    pub const NETWORK_DATA_RECEIVED: &str = "Network.dataReceived";
    pub const NETWORK_REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
}

/// Identifier of a monitored execution context (a browser tab)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability domains the agent enables on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Performance,
    Network,
}

impl Capability {
    pub fn enable_method(&self) -> &'static str {
        match self {
            Capability::Performance => methods::PERFORMANCE_ENABLE,
            Capability::Network => methods::NETWORK_ENABLE,
        }
    }
}

/// Event emitted by a monitored context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevtoolsEvent {
    pub context_id: ContextId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Context lifecycle notification (tab opened / closed)
#[derive(Debug, Clone, PartialEq)]
pub enum ContextLifecycle {
    Opened { context_id: ContextId, url: Option<String> },
    Closed { context_id: ContextId },
}

/// Transport-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("another debugger is already attached to context {0}")]
    AlreadyAttached(ContextId),
    #[error("context {0} is not attached")]
    NotAttached(ContextId),
    #[error("{method} rejected: {message}")]
    Rejected { method: String, message: String },
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Channel to the instrumentation endpoint of the host browser
///
/// Every call is a suspension point for the issuing task only.
#[async_trait]
pub trait DevtoolsTransport: Send + Sync + 'static {
    async fn attach(&self, context: ContextId, protocol_version: &str) -> Result<(), TransportError>;

    async fn detach(&self, context: ContextId) -> Result<(), TransportError>;

    async fn send_command(
        &self,
        context: ContextId,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError>;

    /// Stream of events for every context the transport relays
    fn events(&self) -> broadcast::Receiver<DevtoolsEvent>;

    /// Stream of context lifecycle notifications
    fn lifecycle(&self) -> broadcast::Receiver<ContextLifecycle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_methods() {
        assert_eq!(Capability::Performance.enable_method(), "Performance.enable");
        assert_eq!(Capability::Network.enable_method(), "Network.enable");
    }

    #[test]
    fn test_event_deserialization() {
        let event: DevtoolsEvent = serde_json::from_value(serde_json::json!({
            "context_id": 7,
            "method": "Network.dataReceived",
            "params": { "dataLength": 512 }
        }))
        .unwrap();

        assert_eq!(event.context_id, ContextId(7));
        assert_eq!(event.params["dataLength"], 512);
    }
}
