//! Vigil Agent - browser tab telemetry and safety scoring
//!
//! Building blocks of the agent binary:
//! - Devtools sessions over an MQTT bridge (`devtools`)
//! - Sampling, smoothing, network accounting and intensity (`metrics`)
//! - Context monitoring front door (`monitor`)
//! - Scan jobs against the analysis service (`jobs`) or a local script (`scanner`)
//! - Stability signal exchange (`stability`)
//! - Risk scoring through a text generator (`risk`) and the per-tab pipeline (`assessment`)
//! - Tab open/close handling and the active tab (`supervisor`)

pub mod assessment;
pub mod config;
pub mod devtools;
pub mod jobs;
pub mod metrics;
pub mod monitor;
pub mod risk;
pub mod scanner;
pub mod stability;
pub mod state;
pub mod supervisor;

pub use config::AgentConfig;
pub use devtools::{ContextId, DevtoolsTransport};
pub use monitor::{Monitor, MonitorSettings};
pub use supervisor::{TabAssessment, TabSupervisor};
