//! Agent configuration
//!
//! Handles:
//! - MQTT broker settings for the devtools bridge
//! - Sampling cadence, smoothing factor and attach retry budget
//! - Job, stability and text-generation service endpoints
//! - Local scanner settings
//!
//! Stored as TOML under the OS config directory. `VIGIL_AGENT_CONFIG`
//! overrides the location. Secrets are read from the environment only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "VIGIL_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub sampling: SamplingConfig,
    pub attach: AttachConfig,
    pub jobs: JobsConfig,
    pub stability: StabilityConfig,
    pub llm: LlmConfig,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub command_timeout_secs: u64,
    /// Devtools events buffered for the event pump
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    pub alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    pub backoff_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub base_url: String,
    pub report_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerMode {
    Remote,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub mode: ScannerMode,
    pub script: PathBuf,
    pub rules: PathBuf,
    pub timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            command_timeout_secs: 5,
            event_buffer: 1024,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            alpha: 0.3,
        }
    }
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            backoff_secs: 2,
            max_attempts: 30,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            poll_interval_ms: 2500,
            max_poll_attempts: 100,
            request_timeout_secs: 10,
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            report_interval_secs: 5,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key_env: "API_KEY_GEMINI".to_string(),
            temperature: 0.7,
            max_output_tokens: 800,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: ScannerMode::Remote,
            script: PathBuf::from("scan_site.sh"),
            rules: PathBuf::from("rules.yar"),
            timeout_secs: 120,
        }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, defaults when absent
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Config file location, honoring `VIGIL_AGENT_CONFIG`
    pub fn config_file_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("vigil-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// MQTT client id, derived from the hostname when not configured
    pub fn client_id(&self) -> String {
        self.mqtt.client_id.clone().unwrap_or_else(|| {
            let host = hostname::get().unwrap_or_default().to_string_lossy().to_string();
            format!("vigil-agent-{host}")
        })
    }

    /// Text-generation API key from the configured environment variable
    pub fn llm_api_key(&self) -> Option<String> {
        std::env::var(&self.llm.api_key_env).ok().filter(|key| !key.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.event_buffer, 1024);
        assert_eq!(config.sampling.alpha, 0.3);
        assert_eq!(config.attach.max_attempts, 30);
        assert_eq!(config.jobs.poll_interval_ms, 2500);
        assert_eq!(config.jobs.max_poll_attempts, 100);
        assert_eq!(config.stability.report_interval_secs, 5);
        assert_eq!(config.scanner.mode, ScannerMode::Remote);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[sampling]\ninterval_ms = 500\n\n[scanner]\nmode = \"local\"\n")
            .await
            .unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();

        assert_eq!(config.sampling.interval(), Duration::from_millis(500));
        assert_eq!(config.sampling.alpha, 0.3);
        assert_eq!(config.scanner.mode, ScannerMode::Local);
        assert_eq!(config.llm.model, "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AgentConfig::default();
        config.jobs.base_url = "http://scanner.lan:8080".into();

        config.save_to(&path).await.unwrap();
        let reloaded = AgentConfig::load_from(&path).await.unwrap();

        assert_eq!(reloaded.jobs.base_url, "http://scanner.lan:8080");
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.mqtt.keep_alive_secs, 30);
    }

    #[test]
    fn test_explicit_client_id() {
        let mut config = AgentConfig::default();
        config.mqtt.client_id = Some("vigil-desk".into());
        assert_eq!(config.client_id(), "vigil-desk");
    }
}
