//! Network byte accounting from devtools events
//!
//! Received bytes come from `Network.dataReceived`. Sent bytes are estimated
//! from `Network.requestWillBeSent` as the serialized header length plus the
//! request body length.

use super::TelemetrySession;
use crate::devtools::{methods, DevtoolsEvent, Session};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    DataReceived { data_length: u64 },
    RequestWillBeSent { header_bytes: u64, body_bytes: u64 },
}

impl NetworkEvent {
    /// Decodes the network events the accumulator cares about
    pub fn from_devtools(event: &DevtoolsEvent) -> Option<Self> {
        match event.method.as_str() {
            methods::NETWORK_DATA_RECEIVED => Some(NetworkEvent::DataReceived {
                data_length: event.params.get("dataLength").and_then(Value::as_u64).unwrap_or(0),
            }),
            methods::NETWORK_REQUEST_WILL_BE_SENT => {
                let request = event.params.get("request");
                let header_bytes = request
                    .and_then(|r| r.get("headers"))
                    .and_then(|headers| serde_json::to_string(headers).ok())
                    .map_or(0, |s| s.len() as u64);
                let body_bytes = request
                    .and_then(|r| r.get("postData"))
                    .and_then(Value::as_str)
                    .map_or(0, |s| s.len() as u64);
                Some(NetworkEvent::RequestWillBeSent {
                    header_bytes,
                    body_bytes,
                })
            }
            _ => None,
        }
    }

    pub fn byte_estimate(&self) -> u64 {
        match self {
            NetworkEvent::DataReceived { data_length } => *data_length,
            NetworkEvent::RequestWillBeSent {
                header_bytes,
                body_bytes,
            } => header_bytes.saturating_add(*body_bytes),
        }
    }
}

impl TelemetrySession {
    /// Adds transferred bytes to the running total.
    ///
    /// The first nonzero total is latched as the initial-load figure; returns
    /// it when this call latched it.
    pub fn record_network(&mut self, event: NetworkEvent) -> Option<u64> {
        self.network_total_bytes = self.network_total_bytes.saturating_add(event.byte_estimate());

        if self.initial_load_bytes.is_none() && self.network_total_bytes > 0 {
            self.initial_load_bytes = Some(self.network_total_bytes);
            return self.initial_load_bytes;
        }
        None
    }

    /// Bytes since the previous call; resets the per-tick baseline
    pub fn take_network_delta(&mut self) -> u64 {
        let delta = self.network_total_bytes.saturating_sub(self.prev_network_total);
        self.prev_network_total = self.network_total_bytes;
        delta
    }
}

/// Feeds one devtools event into the session it belongs to.
///
/// Events for other contexts and non-network events are ignored. Returns the
/// bytes added.
pub fn ingest(session: &Session, event: &DevtoolsEvent) -> Option<u64> {
    if event.context_id != session.context_id() || session.is_closed() {
        return None;
    }
    let network_event = NetworkEvent::from_devtools(event)?;
    let bytes = network_event.byte_estimate();

    if let Some(initial) = session.with_telemetry(|t| t.record_network(network_event)) {
        info!("Initial load for context {}: {} bytes", session.context_id(), initial);
    }
    debug!("Context {}: +{} network bytes", session.context_id(), bytes);
    Some(bytes)
}
