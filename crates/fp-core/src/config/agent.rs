//! Agent configuration
//!
//! Written to `agent.toml` on the node by the deployment bootstrap.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the node agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Panel tunnel address (`host:port`)
    pub panel_address: String,

    /// Login name on the tunnel
    pub agent_id: String,

    /// Node this agent reports for
    pub node_id: String,

    /// Tunnel password; the panel only keeps its hash
    pub token: String,

    /// Expected panel host key fingerprint; unchecked when absent
    pub panel_host_key: Option<String>,

    /// Shell spawned for remote sessions (defaults to `$SHELL`, then `/bin/sh`)
    pub default_shell: Option<String>,

    /// Environment applied to every session
    pub default_env: Vec<(String, String)>,

    pub backoff: BackoffConfig,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Operator-supplied database settings, carried verbatim from the deploy
    /// request
    pub database: Option<toml::Table>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            panel_address: "localhost:2222".to_string(),
            agent_id: String::new(),
            node_id: String::new(),
            token: String::new(),
            panel_host_key: None,
            default_shell: None,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(30),
            database: None,
        }
    }
}

impl AgentConfig {
    pub fn hostname(&self) -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    pub fn shell(&self) -> String {
        self.default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Exponential backoff for tunnel reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    #[serde(with = "duration_secs")]
    pub max: Duration,

    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
