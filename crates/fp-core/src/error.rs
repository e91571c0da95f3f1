//! Error taxonomy shared by the control plane and its HTTP surface

use std::path::PathBuf;
use std::time::Duration;

use fp_protocol::ProtocolError;
use thiserror::Error;

use crate::types::NodeId;

/// Top-level error type for fleet-panel operations
#[derive(Error, Debug)]
pub enum PanelError {
    /// Entity does not exist (or no longer exists)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with current state (local node delete, duplicate deploy)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller did not present valid operator credentials
    #[error("Authentication required")]
    Unauthorized,

    /// Caller is authenticated but may not perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Node or agent could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Remote end rejected the stored credentials
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// A bounded wait expired
    #[error("Timed out after {after:?} while {operation}")]
    Timeout { after: Duration, operation: String },

    /// Shell requested on a node that is not tunnel-connected
    #[error("Node {0} is not tunnel-connected")]
    NodeNotTunnel(NodeId),

    /// Request failed validation
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Durable store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PanelError {
    /// `NotFound` for an entity kind and id
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", kind, id))
    }

    pub fn timeout(after: Duration, operation: impl Into<String>) -> Self {
        Self::Timeout {
            after,
            operation: operation.into(),
        }
    }

    /// Stable machine-readable code for API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            PanelError::NotFound(_) => "not_found",
            PanelError::Conflict(_) => "conflict",
            PanelError::Unauthorized => "unauthorized",
            PanelError::Forbidden(_) => "forbidden",
            PanelError::Unreachable(_) => "unreachable",
            PanelError::AuthFailure(_) => "auth_failure",
            PanelError::Timeout { .. } => "timeout",
            PanelError::NodeNotTunnel(_) => "node_not_tunnel",
            PanelError::Invalid(_) => "invalid",
            PanelError::Storage(_) => "storage",
            PanelError::Config(_) => "config",
            PanelError::Protocol(_) => "protocol",
            PanelError::Io(_) => "io",
        }
    }

    /// Whether the failure came from talking to a node or agent
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PanelError::Unreachable(_)
                | PanelError::AuthFailure(_)
                | PanelError::Timeout { .. }
                | PanelError::Protocol(_)
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PanelError::not_found("node", "n1").code(), "not_found");
        assert_eq!(
            PanelError::NodeNotTunnel(NodeId::new("n1")).code(),
            "node_not_tunnel"
        );
        assert_eq!(
            PanelError::timeout(Duration::from_secs(5), "querying metrics").code(),
            "timeout"
        );
    }

    #[test]
    fn remote_failures_are_flagged() {
        assert!(PanelError::Unreachable("agent offline".into()).is_remote());
        assert!(PanelError::AuthFailure("root@10.0.0.2".into()).is_remote());
        assert!(!PanelError::Conflict("busy".into()).is_remote());
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = PanelError::timeout(Duration::from_secs(8), "syncing node n1");
        assert_eq!(err.to_string(), "Timed out after 8s while syncing node n1");
    }
}
