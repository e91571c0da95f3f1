//! Node records and their API views

use serde::{Deserialize, Serialize};

use fp_core::{AgentId, ConnectionType, NodeId, NodeStatus, PanelError, ResourceSnapshot};

/// Agent credential issued during a deploy. Only the token hash is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredential {
    pub agent_id: AgentId,
    pub token_sha256: String,
}

/// Persisted node record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Sealed with the control-plane credential key
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub connection_type: ConnectionType,
    pub is_local: bool,
    pub status: NodeStatus,
    pub last_seen: Option<u64>,
    pub snapshot: Option<ResourceSnapshot>,
    /// Set once a deployed agent has been verified
    pub agent_id: Option<AgentId>,
    /// Credential the current (or pending) agent authenticates with
    pub agent_credential: Option<AgentCredential>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// Whether the node was ever successfully reached
    pub fn provisioned(&self) -> bool {
        match self.connection_type {
            ConnectionType::Tunnel => self.agent_id.is_some() && self.last_seen.is_some(),
            ConnectionType::Direct => self.is_local || self.last_seen.is_some(),
        }
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id.clone(),
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            has_password: self.ssh_password.is_some(),
            ssh_key_path: self.ssh_key_path.clone(),
            connection_type: self.connection_type,
            is_local: self.is_local,
            status: self.status,
            last_seen: self.last_seen,
            cpu_percent: self.snapshot.map(|s| s.cpu_percent),
            ram_percent: self.snapshot.map(|s| s.ram_percent),
            disk_percent: self.snapshot.map(|s| s.disk_percent),
            uptime_secs: self.snapshot.map(|s| s.uptime_secs),
            agent_id: self.agent_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What the API returns for a node. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub has_password: bool,
    pub ssh_key_path: Option<String>,
    pub connection_type: ConnectionType,
    pub is_local: bool,
    pub status: NodeStatus,
    pub last_seen: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub ram_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub uptime_secs: Option<u64>,
    pub agent_id: Option<AgentId>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Body of a create request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub connection_type: Option<ConnectionType>,
}

impl NewNode {
    pub fn validate(&self) -> Result<(), PanelError> {
        require("name", &self.name)?;
        require("hostname", &self.hostname)?;
        require("ip", &self.ip)?;
        validate_ip(&self.ip)?;
        if self.ssh_port == Some(0) {
            return Err(PanelError::Invalid("sshPort must be between 1 and 65535".into()));
        }
        Ok(())
    }
}

/// Body of a partial update. Absent fields are left alone; a blank password
/// keeps the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_password: Option<String>,
    /// Empty string clears the key reference
    pub ssh_key_path: Option<String>,
    pub connection_type: Option<ConnectionType>,
    /// Only `maintenance` (pause) or `active` (resume) may be requested
    pub status: Option<NodeStatus>,
}

impl NodeUpdate {
    pub fn validate(&self) -> Result<(), PanelError> {
        if let Some(name) = &self.name {
            require("name", name)?;
        }
        if let Some(hostname) = &self.hostname {
            require("hostname", hostname)?;
        }
        if let Some(ip) = &self.ip {
            require("ip", ip)?;
            validate_ip(ip)?;
        }
        if self.ssh_port == Some(0) {
            return Err(PanelError::Invalid("sshPort must be between 1 and 65535".into()));
        }
        match self.status {
            None | Some(NodeStatus::Maintenance) | Some(NodeStatus::Active) => Ok(()),
            Some(other) => Err(PanelError::Invalid(format!(
                "status '{}' is managed by the panel; only 'maintenance' or 'active' may be set",
                other
            ))),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), PanelError> {
    if value.trim().is_empty() {
        Err(PanelError::Invalid(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

fn validate_ip(ip: &str) -> Result<(), PanelError> {
    ip.trim()
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| PanelError::Invalid(format!("'{}' is not an IP address", ip)))
}
