//! Vigil Agent - monitors browser tabs and scores their safety
//!
//! Event-driven main loop around a `TabSupervisor`:
//! - Tab opened: start monitoring (unless restricted) and schedule an assessment
//! - Tab closed: tear the session down
//! - Finished assessments are published on `vigil/agent/assessment@v1`
//! - Every snapshot is published on `vigil/agent/snapshot@v1`
//! - Deltas go to the stability service on a fixed cadence

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_agent::assessment::{Assessor, ScanSource};
use vigil_agent::config::{AgentConfig, ScannerMode};
use vigil_agent::devtools::bridge::MqttBridge;
use vigil_agent::devtools::AttachPolicy;
use vigil_agent::jobs::{HttpJobService, PollPolicy, ScanOrchestrator};
use vigil_agent::metrics::Snapshot;
use vigil_agent::risk::{GeminiClient, RiskAggregator};
use vigil_agent::scanner::ScanRunner;
use vigil_agent::stability::HttpStabilityService;
use vigil_agent::{Monitor, MonitorSettings, TabAssessment, TabSupervisor};

const SNAPSHOT_TOPIC: &str = "vigil/agent/snapshot@v1";
const ASSESSMENT_TOPIC: &str = "vigil/agent/assessment@v1";

type AgentSupervisor = TabSupervisor<MqttBridge, HttpJobService, HttpStabilityService, GeminiClient>;

/// Main agent state
struct Agent {
    config: AgentConfig,
    mqtt_client: AsyncClient,
    bridge: Arc<MqttBridge>,
    supervisor: Arc<AgentSupervisor>,
}

impl Agent {
    /// Build the agent and its collaborators from configuration
    fn new(config: AgentConfig) -> Result<(Self, EventLoop)> {
        info!("Initializing Vigil Agent v{}", env!("CARGO_PKG_VERSION"));

        let mut mqtt_options = MqttOptions::new(config.client_id(), &config.mqtt.broker_host, config.mqtt.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
        mqtt_options.set_clean_session(true);
        let (mqtt_client, eventloop) = AsyncClient::new(mqtt_options, 64);

        let bridge = Arc::new(
            MqttBridge::new(mqtt_client.clone(), Duration::from_secs(config.mqtt.command_timeout_secs))
                .with_event_buffer(config.mqtt.event_buffer),
        );
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&bridge),
            MonitorSettings {
                sample_interval: config.sampling.interval(),
                alpha: config.sampling.alpha,
                attach: AttachPolicy {
                    backoff: Duration::from_secs(config.attach.backoff_secs),
                    max_attempts: config.attach.max_attempts,
                },
            },
        ));

        let request_timeout = Duration::from_secs(config.jobs.request_timeout_secs);
        let scans = match config.scanner.mode {
            ScannerMode::Remote => ScanSource::Remote(ScanOrchestrator::new(
                HttpJobService::new(&config.jobs.base_url, request_timeout)
                    .context("Failed to build job service client")?,
                PollPolicy {
                    interval: Duration::from_millis(config.jobs.poll_interval_ms),
                    max_attempts: config.jobs.max_poll_attempts,
                },
            )),
            ScannerMode::Local => ScanSource::Local(ScanRunner::new(
                &config.scanner.script,
                &config.scanner.rules,
                Duration::from_secs(config.scanner.timeout_secs),
            )),
        };
        let stability = HttpStabilityService::new(&config.stability.base_url, request_timeout)
            .context("Failed to build stability client")?;

        let api_key = config.llm_api_key();
        if api_key.is_none() {
            warn!("{} is not set; risk scores will use the fallback", config.llm.api_key_env);
        }
        let generator = GeminiClient::new(&config.llm.endpoint, &config.llm.model, api_key, request_timeout)
            .context("Failed to build text generation client")?
            .with_sampling(config.llm.temperature, config.llm.max_output_tokens);

        let assessor = Arc::new(Assessor::new(scans, stability, RiskAggregator::new(generator)));
        // Let the first snapshots land before classifying
        let settle = config.sampling.interval() * 2;
        let supervisor = Arc::new(TabSupervisor::new(monitor, assessor, settle));

        Ok((
            Agent {
                config,
                mqtt_client,
                bridge,
                supervisor,
            },
            eventloop,
        ))
    }

    /// Start agent main loop
    async fn run(self, eventloop: EventLoop) -> Result<()> {
        info!("Starting agent main loop...");

        let bridge_task = self.bridge.spawn(eventloop);
        let event_pump = self.supervisor.monitor().spawn_event_pump();
        let mut snapshots = self.supervisor.monitor().subscribe();
        let mut assessments = self.supervisor.subscribe_assessments();
        let lifecycle_task = self.supervisor.spawn();

        let mut report_timer = interval(Duration::from_secs(self.config.stability.report_interval_secs.max(1)));
        report_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                assessment = assessments.recv() => match assessment {
                    Ok(assessment) => self.publish_assessment(&assessment).await,
                    Err(RecvError::Lagged(skipped)) => warn!("Dropped {} assessments", skipped),
                    Err(RecvError::Closed) => break,
                },

                snapshot = snapshots.recv() => match snapshot {
                    Ok(snapshot) => self.publish_snapshot(&snapshot).await,
                    Err(RecvError::Lagged(skipped)) => debug!("Dropped {} snapshots", skipped),
                    Err(RecvError::Closed) => break,
                },

                _ = report_timer.tick() => {
                    self.supervisor.report_stability();
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        lifecycle_task.abort();
        self.supervisor.shutdown().await;
        event_pump.abort();
        bridge_task.abort();
        Ok(())
    }

    async fn publish_assessment(&self, assessment: &TabAssessment) {
        if let Err(e) = publish(&self.mqtt_client, ASSESSMENT_TOPIC, assessment).await {
            error!("Failed to publish assessment: {:#}", e);
        }
    }

    async fn publish_snapshot(&self, snapshot: &Snapshot) {
        if let Err(e) = publish(&self.mqtt_client, SNAPSHOT_TOPIC, snapshot).await {
            error!("Failed to publish snapshot: {:#}", e);
        }
    }
}

async fn publish<T: Serialize>(client: &AsyncClient, topic: &str, message: &T) -> Result<()> {
    let payload = serde_json::to_string(message).context("Failed to serialize message")?;
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .with_context(|| format!("Failed to publish on {topic}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil_agent=info")))
        .init();

    info!("🛡️ Vigil Agent starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    let (agent, eventloop) = Agent::new(config).context("Failed to create agent")?;

    agent.run(eventloop).await.context("Agent execution failed")?;

    Ok(())
}
