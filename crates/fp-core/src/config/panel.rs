//! Panel daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the control-plane daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Address the admin HTTP API binds to
    pub http_bind: String,

    /// Address the agent tunnel (SSH server) binds to
    pub tunnel_bind: String,

    /// `host:port` that deployed agents dial; defaults to the local host name
    /// and the tunnel port
    pub public_tunnel_address: Option<String>,

    /// Directory for nodes.json, jobs.json, metrics/ and audit.log
    pub data_dir: PathBuf,

    /// Tunnel server host key (generated on first start)
    pub host_key_path: PathBuf,

    /// 32-byte key sealing stored node passwords (generated on first start)
    pub credential_key_path: PathBuf,

    /// Operators allowed to call the API
    pub operators: Vec<OperatorToken>,

    /// Name given to the local node when it is first created
    pub local_node_name: Option<String>,

    pub sync: SyncConfig,
    pub deploy: DeployConfig,
    pub shell: ShellConfig,
    pub agents: AgentsConfig,
    pub history: HistoryConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            http_bind: "0.0.0.0:8420".to_string(),
            tunnel_bind: "0.0.0.0:2222".to_string(),
            public_tunnel_address: None,
            data_dir: super::default_data_dir(),
            host_key_path: config_dir.join("tunnel_host_key"),
            credential_key_path: config_dir.join("credential.key"),
            operators: Vec::new(),
            local_node_name: None,
            sync: SyncConfig::default(),
            deploy: DeployConfig::default(),
            shell: ShellConfig::default(),
            agents: AgentsConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Address agents are told to dial
    pub fn agent_dial_address(&self) -> String {
        if let Some(addr) = &self.public_tunnel_address {
            return addr.clone();
        }
        let port = self
            .tunnel_bind
            .rsplit_once(':')
            .map(|(_, p)| p)
            .unwrap_or("2222");
        format!(
            "{}:{}",
            gethostname::gethostname().to_string_lossy(),
            port
        )
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, addr) in [("http_bind", &self.http_bind), ("tunnel_bind", &self.tunnel_bind)] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' is not a socket address",
                    name, addr
                )));
            }
        }
        if self.sync.concurrency == 0 {
            return Err(ConfigError::Invalid("sync.concurrency must be at least 1".into()));
        }
        if self.sync.interval.is_zero() {
            return Err(ConfigError::Invalid("sync.interval must be positive".into()));
        }
        if self.history.max_points < 2 {
            return Err(ConfigError::Invalid("history.max_points must be at least 2".into()));
        }
        if self.shell.max_buffered_bytes == 0 {
            return Err(ConfigError::Invalid(
                "shell.max_buffered_bytes must be positive".into(),
            ));
        }
        for op in &self.operators {
            if op.token_sha256.len() != 64 || !op.token_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ConfigError::Invalid(format!(
                    "operator '{}' token_sha256 must be 64 hex characters",
                    op.name
                )));
            }
        }
        Ok(())
    }
}

/// An API operator, identified by the SHA-256 of its bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorToken {
    pub name: String,
    /// Lowercase hex SHA-256 of the bearer token
    pub token_sha256: String,
    #[serde(default = "default_true")]
    pub admin: bool,
}

fn default_true() -> bool {
    true
}

/// Metrics sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background sync period
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Bound on one node sync
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Manual triggers within this window reuse the last result
    #[serde(with = "duration_secs")]
    pub debounce: Duration,

    /// Nodes synced in parallel by the background loop
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(8),
            debounce: Duration::from_secs(2),
            concurrency: 8,
        }
    }
}

/// Agent deployment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Hard limit on one deployment job
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Secure-shell connect and authenticate
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Each remote bootstrap command
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Wait for the freshly started agent to dial in
    #[serde(with = "duration_secs")]
    pub registration_timeout: Duration,

    /// Local agent binary uploaded to nodes
    pub agent_binary: Option<PathBuf>,

    /// URL nodes download the agent from when no local binary is configured
    pub agent_download_url: Option<String>,

    /// Install prefix on the node
    pub remote_dir: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(120),
            registration_timeout: Duration::from_secs(120),
            agent_binary: None,
            agent_download_url: None,
            remote_dir: "/opt/fleet-agent".to_string(),
        }
    }
}

/// Tunnel shell gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Sessions not polled for this long are closed
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Wait for the agent to acknowledge a shell open
    #[serde(with = "duration_secs")]
    pub open_timeout: Duration,

    /// Bound on forwarding one input or resize
    #[serde(with = "duration_secs")]
    pub io_timeout: Duration,

    /// Idle sweep period
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Undelivered output kept per session before the oldest is dropped
    pub max_buffered_bytes: usize,

    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180),
            open_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(15),
            max_buffered_bytes: 1024 * 1024,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// Tunnel agent liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// An agent silent for this long is disconnected and its node no longer
    /// counts as fresh
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,

    /// Bound on a metrics query to an agent
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(90),
            query_timeout: Duration::from_secs(8),
        }
    }
}

/// Metric history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Samples older than this are compacted away on startup and hourly
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Upper bound on points returned by a usage query
    pub max_points: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 86_400),
            max_points: 288,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PanelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.timeout, Duration::from_secs(8));
        assert_eq!(config.shell.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.deploy.timeout, Duration::from_secs(600));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: PanelConfig = toml::from_str(
            r#"
            http_bind = "127.0.0.1:9000"

            [sync]
            interval = "1m"

            [[operators]]
            name = "ops"
            token_sha256 = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
            "#,
        )
        .unwrap();
        assert_eq!(config.http_bind, "127.0.0.1:9000");
        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.debounce, Duration::from_secs(2));
        assert!(config.operators[0].admin);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = PanelConfig::default();
        config.sync.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.tunnel_bind = "not-an-address".into();
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.operators.push(OperatorToken {
            name: "short".into(),
            token_sha256: "abc".into(),
            admin: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_public_address_wins() {
        let mut config = PanelConfig::default();
        config.public_tunnel_address = Some("panel.example.net:2222".into());
        assert_eq!(config.agent_dial_address(), "panel.example.net:2222");
    }
}
