//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use fp_protocol::{ResourceSnapshot, TerminalSize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a managed node
    NodeId
);
string_id!(
    /// Identifier of a deployed agent, also its tunnel login name
    AgentId
);
string_id!(
    /// Identifier of an interactive shell session
    ShellId
);

impl NodeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl AgentId {
    pub fn generate() -> Self {
        Self(format!("agt-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl ShellId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// How the control plane reaches a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Control plane connects to the node (local probe or secure shell)
    #[default]
    Direct,
    /// Node's agent dials out to the control plane
    Tunnel,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Direct => write!(f, "direct"),
            ConnectionType::Tunnel => write!(f, "tunnel"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "tunnel" => Ok(Self::Tunnel),
            other => Err(format!("unknown connection type '{}'", other)),
        }
    }
}

/// Displayed health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Reporting metrics; for tunnel nodes the agent is bound and fresh
    #[default]
    Active,
    /// Agent connected but has not reported metrics yet
    Online,
    /// Was healthy, now unreachable
    Offline,
    /// Operator-paused; excluded from background sync
    Maintenance,
    /// Never provisioned or never reachable
    ConnectionError,
}

impl NodeStatus {
    /// Status after a failed sync, given whether the node was ever provisioned
    pub fn degraded(self, provisioned: bool) -> Self {
        match self {
            NodeStatus::Maintenance => NodeStatus::Maintenance,
            _ if !provisioned => NodeStatus::ConnectionError,
            NodeStatus::Active | NodeStatus::Online | NodeStatus::Offline => NodeStatus::Offline,
            NodeStatus::ConnectionError => NodeStatus::ConnectionError,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::ConnectionError => "connection_error",
        };
        f.write_str(s)
    }
}

/// Deployment job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shell session lifecycle (`Disconnected` is terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellState {
    Connecting,
    Connected,
    Disconnected,
}

/// An authenticated caller of the admin API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    pub admin: bool,
}

impl Operator {
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            admin: true,
        }
    }

    /// Identity used for work the daemon starts on its own
    pub fn system() -> Self {
        Self::admin("system")
    }
}

/// One point of a node's resource time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub node_id: NodeId,
    /// Unix milliseconds
    pub timestamp: u64,
    #[serde(flatten)]
    pub snapshot: ResourceSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::ConnectionError).unwrap(),
            "\"connection_error\""
        );
        assert_eq!(NodeStatus::ConnectionError.to_string(), "connection_error");
    }

    #[test]
    fn degraded_distinguishes_never_provisioned() {
        assert_eq!(NodeStatus::Active.degraded(true), NodeStatus::Offline);
        assert_eq!(NodeStatus::Online.degraded(true), NodeStatus::Offline);
        assert_eq!(NodeStatus::Active.degraded(false), NodeStatus::ConnectionError);
        assert_eq!(
            NodeStatus::ConnectionError.degraded(true),
            NodeStatus::ConnectionError
        );
        assert_eq!(NodeStatus::Maintenance.degraded(false), NodeStatus::Maintenance);
    }

    #[test]
    fn connection_type_parses() {
        assert_eq!("Tunnel".parse::<ConnectionType>(), Ok(ConnectionType::Tunnel));
        assert!("carrier-pigeon".parse::<ConnectionType>().is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ShellId::generate(), ShellId::generate());
        assert!(AgentId::generate().as_str().starts_with("agt-"));
    }

    #[test]
    fn metric_sample_flattens_snapshot() {
        let sample = MetricSample {
            node_id: NodeId::new("n1"),
            timestamp: 1_700_000_000_000,
            snapshot: ResourceSnapshot {
                cpu_percent: 5.0,
                ram_percent: 10.0,
                disk_percent: 20.0,
                uptime_secs: 30,
            },
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["cpuPercent"], 5.0);
        assert_eq!(json["uptimeSecs"], 30);
    }
}
