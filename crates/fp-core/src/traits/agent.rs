//! Capability for talking to a connected node agent

use async_trait::async_trait;
use bytes::Bytes;
use fp_protocol::StreamId;
use tokio::sync::mpsc;

use crate::error::PanelError;
use crate::types::{AgentId, ResourceSnapshot, TerminalSize};

/// Something a remote shell produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Bytes),
    Exited { exit_code: Option<i32> },
}

/// Parameters for opening a remote shell
#[derive(Debug, Clone, Default)]
pub struct ShellRequest {
    /// Program to run; the agent's default shell when `None`
    pub shell: Option<String>,
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

/// A shell the agent has acknowledged
///
/// `events` ends (returns `None`) if the agent connection drops.
#[derive(Debug)]
pub struct RemoteShell {
    pub stream_id: StreamId,
    pub pid: u32,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// RPC surface of connected agents, keyed by agent id
#[async_trait]
pub trait AgentRpc: Send + Sync {
    /// Whether the agent currently holds a live tunnel
    fn is_connected(&self, agent_id: &AgentId) -> bool;

    /// Ask the agent for a fresh resource snapshot
    async fn query_metrics(&self, agent_id: &AgentId) -> Result<ResourceSnapshot, PanelError>;

    /// Open a shell; resolves once the agent reports the remote pid
    async fn open_shell(
        &self,
        agent_id: &AgentId,
        request: ShellRequest,
    ) -> Result<RemoteShell, PanelError>;

    async fn send_input(
        &self,
        agent_id: &AgentId,
        stream_id: StreamId,
        data: Bytes,
    ) -> Result<(), PanelError>;

    async fn resize_shell(
        &self,
        agent_id: &AgentId,
        stream_id: StreamId,
        size: TerminalSize,
    ) -> Result<(), PanelError>;

    /// Release the remote shell. Unknown streams are not an error.
    async fn close_shell(&self, agent_id: &AgentId, stream_id: StreamId)
        -> Result<(), PanelError>;

    /// Drop the agent's tunnel, if any
    async fn disconnect(&self, agent_id: &AgentId);
}
