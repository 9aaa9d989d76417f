/*!
Mock devtools transport for development without a browser

Implements `DevtoolsTransport` in memory:
- Scripted `Performance.getMetrics` readings per context
- Injectable attach and sample failures
- Event and lifecycle emission for the event pump and main loop
- Command log for assertions
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use vigil_agent::devtools::{methods, ContextId, ContextLifecycle, DevtoolsEvent, DevtoolsTransport, TransportError};

/// One scripted metrics reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsReading {
    pub task_duration_secs: f64,
    pub js_heap_used_bytes: f64,
    pub navigation_start: Option<f64>,
    pub dom_content_loaded: Option<f64>,
}

impl MetricsReading {
    pub fn new(task_duration_secs: f64, js_heap_used_mb: f64) -> Self {
        Self {
            task_duration_secs,
            js_heap_used_bytes: js_heap_used_mb * 1024.0 * 1024.0,
            navigation_start: None,
            dom_content_loaded: None,
        }
    }

    pub fn with_load_time_ms(mut self, load_time_ms: f64) -> Self {
        self.navigation_start = Some(1000.0);
        self.dom_content_loaded = Some(1000.0 + load_time_ms / 1000.0);
        self
    }

    /// `Performance.getMetrics` result body
    pub fn to_result(&self) -> Value {
        let mut metrics = vec![
            json!({ "name": "TaskDuration", "value": self.task_duration_secs }),
            json!({ "name": "JSHeapUsedSize", "value": self.js_heap_used_bytes }),
        ];
        if let Some(start) = self.navigation_start {
            metrics.push(json!({ "name": "NavigationStart", "value": start }));
        }
        if let Some(loaded) = self.dom_content_loaded {
            metrics.push(json!({ "name": "DomContentLoaded", "value": loaded }));
        }
        json!({ "metrics": metrics })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    pub context_id: ContextId,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct ContextScript {
    readings: VecDeque<MetricsReading>,
    attach_failures: u32,
    sample_failures: u32,
    already_attached: bool,
}

/// In-memory devtools transport
pub struct MockDevtools {
    scripts: Mutex<HashMap<ContextId, ContextScript>>,
    attached: Mutex<Vec<ContextId>>,
    attach_calls: Mutex<HashMap<ContextId, u32>>,
    detach_calls: Mutex<HashMap<ContextId, u32>>,
    commands: Mutex<Vec<RecordedCommand>>,
    events: broadcast::Sender<DevtoolsEvent>,
    lifecycle: broadcast::Sender<ContextLifecycle>,
}

impl MockDevtools {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            attached: Mutex::new(Vec::new()),
            attach_calls: Mutex::new(HashMap::new()),
            detach_calls: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            events: broadcast::channel(1024).0,
            lifecycle: broadcast::channel(64).0,
        }
    }

    /// Transport whose event channel holds only `capacity` undelivered events
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity).0,
            ..Self::new()
        }
    }

    /// Queues readings for a context; the last one repeats once the queue drains
    pub fn script_metrics(&self, context: ContextId, readings: impl IntoIterator<Item = MetricsReading>) {
        self.scripts.lock().entry(context).or_default().readings.extend(readings);
    }

    /// Fails the next `count` attach attempts for a context
    pub fn fail_attaches(&self, context: ContextId, count: u32) {
        self.scripts.lock().entry(context).or_default().attach_failures = count;
    }

    /// Fails the next `count` metrics reads for a context
    pub fn fail_samples(&self, context: ContextId, count: u32) {
        self.scripts.lock().entry(context).or_default().sample_failures = count;
    }

    /// Reports "another debugger is already attached" on the next attach
    pub fn occupy(&self, context: ContextId) {
        self.scripts.lock().entry(context).or_default().already_attached = true;
    }

    pub fn emit_event(&self, event: DevtoolsEvent) {
        log::debug!("📡 [MOCK] Event {} for context {}", event.method, event.context_id);
        let _ = self.events.send(event);
    }

    pub fn open_context(&self, context: ContextId, url: &str) {
        log::info!("🆕 [MOCK] Context {} opened at {}", context, url);
        let _ = self.lifecycle.send(ContextLifecycle::Opened {
            context_id: context,
            url: Some(url.to_string()),
        });
    }

    pub fn close_context(&self, context: ContextId) {
        log::info!("🗑️ [MOCK] Context {} closed", context);
        let _ = self.lifecycle.send(ContextLifecycle::Closed { context_id: context });
    }

    pub fn is_attached(&self, context: ContextId) -> bool {
        self.attached.lock().contains(&context)
    }

    pub fn attach_calls(&self, context: ContextId) -> u32 {
        self.attach_calls.lock().get(&context).copied().unwrap_or(0)
    }

    pub fn detach_calls(&self, context: ContextId) -> u32 {
        self.detach_calls.lock().get(&context).copied().unwrap_or(0)
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().clone()
    }

    /// Commands sent with a given method, across contexts
    pub fn commands_named(&self, method: &str) -> Vec<RecordedCommand> {
        self.commands.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    fn next_reading(&self, context: ContextId) -> Result<MetricsReading, TransportError> {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(context).or_default();
        if script.sample_failures > 0 {
            script.sample_failures -= 1;
            return Err(TransportError::NotAttached(context));
        }
        let reading = if script.readings.len() > 1 {
            script.readings.pop_front()
        } else {
            script.readings.front().copied()
        };
        Ok(reading.unwrap_or_else(|| MetricsReading::new(0.0, 0.0)))
    }
}

impl Default for MockDevtools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevtoolsTransport for MockDevtools {
    async fn attach(&self, context: ContextId, _protocol_version: &str) -> Result<(), TransportError> {
        *self.attach_calls.lock().entry(context).or_insert(0) += 1;

        {
            let mut scripts = self.scripts.lock();
            let script = scripts.entry(context).or_default();
            if script.attach_failures > 0 {
                script.attach_failures -= 1;
                return Err(TransportError::Unavailable(format!("tab {context} is not ready")));
            }
            if std::mem::take(&mut script.already_attached) {
                return Err(TransportError::AlreadyAttached(context));
            }
        }

        let mut attached = self.attached.lock();
        if !attached.contains(&context) {
            attached.push(context);
        }
        log::info!("🔗 [MOCK] Attached to context {}", context);
        Ok(())
    }

    async fn detach(&self, context: ContextId) -> Result<(), TransportError> {
        *self.detach_calls.lock().entry(context).or_insert(0) += 1;
        let mut attached = self.attached.lock();
        match attached.iter().position(|c| *c == context) {
            Some(index) => {
                attached.remove(index);
                Ok(())
            }
            None => Err(TransportError::NotAttached(context)),
        }
    }

    async fn send_command(&self, context: ContextId, method: &str, params: Value) -> Result<Value, TransportError> {
        self.commands.lock().push(RecordedCommand {
            context_id: context,
            method: method.to_string(),
            params,
        });

        match method {
            methods::PERFORMANCE_GET_METRICS => Ok(self.next_reading(context)?.to_result()),
            _ => Ok(json!({})),
        }
    }

    fn events(&self) -> broadcast::Receiver<DevtoolsEvent> {
        self.events.subscribe()
    }

    fn lifecycle(&self) -> broadcast::Receiver<ContextLifecycle> {
        self.lifecycle.subscribe()
    }
}

/// Builders for devtools events as the bridge relays them
pub struct DevtoolsEventBuilder;

impl DevtoolsEventBuilder {
    pub fn data_received(context: ContextId, data_length: u64) -> DevtoolsEvent {
        DevtoolsEvent {
            context_id: context,
            method: methods::NETWORK_DATA_RECEIVED.to_string(),
            params: json!({ "requestId": "1000.1", "dataLength": data_length, "encodedDataLength": 0 }),
        }
    }

    pub fn request_will_be_sent(context: ContextId, headers: Value, post_data: Option<&str>) -> DevtoolsEvent {
        let mut request = json!({ "url": "https://example.com/api", "method": "POST", "headers": headers });
        if let Some(body) = post_data {
            request["postData"] = Value::String(body.to_string());
        }
        DevtoolsEvent {
            context_id: context,
            method: methods::NETWORK_REQUEST_WILL_BE_SENT.to_string(),
            params: json!({ "requestId": "1000.2", "request": request }),
        }
    }
}
