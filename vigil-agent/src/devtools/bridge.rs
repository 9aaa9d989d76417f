//! MQTT devtools bridge
//!
//! Relays devtools commands to the browser-side extension and matches the
//! replies back to their callers by request id:
//! - Commands go out on `vigil/devtools/command@v1`
//! - Replies arrive on `vigil/devtools/response@v1`
//! - Context events arrive on `vigil/devtools/event@v1`
//! - Tab open/close notifications arrive on `vigil/contexts/lifecycle@v1`

use super::{ContextId, ContextLifecycle, DevtoolsEvent, DevtoolsTransport, TransportError};
use crate::state::{new_registry, SharedMap};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const COMMAND_TOPIC: &str = "vigil/devtools/command@v1";
pub const RESPONSE_TOPIC: &str = "vigil/devtools/response@v1";
pub const EVENT_TOPIC: &str = "vigil/devtools/event@v1";
pub const LIFECYCLE_TOPIC: &str = "vigil/contexts/lifecycle@v1";

const ATTACH_METHOD: &str = "Target.attach";
const DETACH_METHOD: &str = "Target.detach";
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Command published to the extension
#[derive(Debug, Serialize)]
pub struct BridgeCommand {
    pub request_id: String,
    pub context_id: ContextId,
    pub method: String,
    pub params: Value,
}

/// Reply from the extension, carrying either a result or an error message
#[derive(Debug, Deserialize)]
pub struct BridgeResponse {
    pub request_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LifecycleKind {
    Opened,
    Closed,
}

#[derive(Debug, Deserialize)]
struct LifecycleMessage {
    context_id: ContextId,
    event: LifecycleKind,
    #[serde(default)]
    url: Option<String>,
}

pub struct MqttBridge {
    client: AsyncClient,
    pending: SharedMap<String, oneshot::Sender<BridgeResponse>>,
    events: broadcast::Sender<DevtoolsEvent>,
    lifecycle: broadcast::Sender<ContextLifecycle>,
    command_timeout: Duration,
}

impl MqttBridge {
    pub fn new(client: AsyncClient, command_timeout: Duration) -> Self {
        Self {
            client,
            pending: new_registry(),
            events: broadcast::channel(DEFAULT_EVENT_BUFFER).0,
            lifecycle: broadcast::channel(64).0,
            command_timeout,
        }
    }

    /// Events buffered per subscriber before the slowest one starts losing them
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.events = broadcast::channel(capacity.max(1)).0;
        self
    }

    pub async fn subscribe_topics(&self) -> Result<(), rumqttc::ClientError> {
        for topic in [RESPONSE_TOPIC, EVENT_TOPIC, LIFECYCLE_TOPIC] {
            self.client.subscribe(topic, QoS::AtLeastOnce).await?;
            debug!("Subscribed to {}", topic);
        }
        Ok(())
    }

    /// Drives the MQTT event loop, resubscribing after every reconnect
    pub fn spawn(self: &Arc<Self>, mut eventloop: EventLoop) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        if let Err(e) = bridge.subscribe_topics().await {
                            error!("Failed to subscribe bridge topics: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        bridge.handle_publish(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }

    /// Routes an incoming publication to pending requests or subscribers
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) {
        match topic {
            RESPONSE_TOPIC => match serde_json::from_slice::<BridgeResponse>(payload) {
                Ok(response) => self.handle_response(response),
                Err(e) => warn!("Malformed devtools response: {}", e),
            },
            EVENT_TOPIC => match serde_json::from_slice::<DevtoolsEvent>(payload) {
                // No receivers is fine; nothing is monitored yet
                Ok(event) => {
                    let _ = self.events.send(event);
                }
                Err(e) => warn!("Malformed devtools event: {}", e),
            },
            LIFECYCLE_TOPIC => match serde_json::from_slice::<LifecycleMessage>(payload) {
                Ok(message) => {
                    let notification = match message.event {
                        LifecycleKind::Opened => ContextLifecycle::Opened {
                            context_id: message.context_id,
                            url: message.url,
                        },
                        LifecycleKind::Closed => ContextLifecycle::Closed {
                            context_id: message.context_id,
                        },
                    };
                    let _ = self.lifecycle.send(notification);
                }
                Err(e) => warn!("Malformed lifecycle message: {}", e),
            },
            other => debug!("Ignoring publication on {}", other),
        }
    }

    fn handle_response(&self, response: BridgeResponse) {
        let sender = self.pending.lock().remove(&response.request_id);
        match sender {
            Some(sender) => {
                let request_id = response.request_id.clone();
                if sender.send(response).is_err() {
                    debug!("Caller for request {} went away before the reply", request_id);
                }
            }
            None => debug!("Reply for unknown request {}", response.request_id),
        }
    }

    async fn request(
        &self,
        context: ContextId,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let command = BridgeCommand {
            request_id: Uuid::new_v4().to_string(),
            context_id: context,
            method: method.to_string(),
            params,
        };
        let request_id = command.request_id.clone();
        let payload = serde_json::to_vec(&command)
            .map_err(|e| TransportError::Unavailable(format!("cannot encode command: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self
            .client
            .publish(COMMAND_TOPIC, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::Unavailable(e.to_string()));
        }

        let response = match timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(TransportError::Unavailable("reply channel closed".into()));
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(TransportError::Timeout(self.command_timeout));
            }
        };

        match response.error {
            Some(message) => Err(classify_error(context, method, message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Maps an extension error message onto a transport error
fn classify_error(context: ContextId, method: &str, message: String) -> TransportError {
    let lowered = message.to_lowercase();
    if lowered.contains("already attached") {
        TransportError::AlreadyAttached(context)
    } else if lowered.contains("not attached") || lowered.contains("no tab with") {
        TransportError::NotAttached(context)
    } else {
        TransportError::Rejected {
            method: method.to_string(),
            message,
        }
    }
}

#[async_trait]
impl DevtoolsTransport for MqttBridge {
    async fn attach(&self, context: ContextId, protocol_version: &str) -> Result<(), TransportError> {
        self.request(context, ATTACH_METHOD, json!({ "protocolVersion": protocol_version }))
            .await
            .map(|_| ())
    }

    async fn detach(&self, context: ContextId) -> Result<(), TransportError> {
        self.request(context, DETACH_METHOD, json!({})).await.map(|_| ())
    }

    async fn send_command(
        &self,
        context: ContextId,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        self.request(context, method, params).await
    }

    fn events(&self) -> broadcast::Receiver<DevtoolsEvent> {
        self.events.subscribe()
    }

    fn lifecycle(&self) -> broadcast::Receiver<ContextLifecycle> {
        self.lifecycle.subscribe()
    }
}
