//! `AgentRpc` over the agent tunnel

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use fp_core::traits::{AgentRpc, RemoteShell, ShellRequest};
use fp_core::{AgentId, PanelError, ResourceSnapshot, TerminalSize};
use fp_protocol::StreamId;

use super::pool::{AgentCommand, AgentConnection, AgentPool};

/// Buffered shell events per stream before the tunnel reader waits
const SHELL_EVENT_BUFFER: usize = 256;

pub struct TunnelRpc {
    pool: Arc<AgentPool>,
    query_timeout: Duration,
}

impl TunnelRpc {
    pub fn new(pool: Arc<AgentPool>, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    fn connection(&self, agent_id: &AgentId) -> Result<Arc<AgentConnection>, PanelError> {
        self.pool
            .get(agent_id)
            .filter(|c| c.is_open())
            .ok_or_else(|| PanelError::Unreachable(format!("agent {} is not connected", agent_id)))
    }
}

/// Removes a pending request if the waiting future is dropped or fails
struct PendingMetrics {
    conn: Arc<AgentConnection>,
    request_id: u64,
}

impl Drop for PendingMetrics {
    fn drop(&mut self) {
        self.conn.forget_metrics(self.request_id);
    }
}

/// Undoes a half-open shell unless disarmed
struct PendingShell {
    conn: Arc<AgentConnection>,
    stream_id: StreamId,
    armed: bool,
}

impl Drop for PendingShell {
    fn drop(&mut self) {
        if self.armed {
            self.conn.forget_shell(self.stream_id);
            self.conn.try_send(AgentCommand::CloseShell {
                stream_id: self.stream_id,
            });
        }
    }
}

#[async_trait]
impl AgentRpc for TunnelRpc {
    fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.pool.get(agent_id).map(|c| c.is_open()).unwrap_or(false)
    }

    async fn query_metrics(&self, agent_id: &AgentId) -> Result<ResourceSnapshot, PanelError> {
        let conn = self.connection(agent_id)?;
        let request_id = conn.next_request_id();
        let reply = conn.await_metrics(request_id);
        let _pending = PendingMetrics {
            conn: Arc::clone(&conn),
            request_id,
        };

        let exchange = async {
            conn.send(AgentCommand::QueryMetrics { request_id }).await?;
            reply.await.map_err(|_| {
                PanelError::Unreachable(format!("agent {} disconnected", agent_id))
            })?
        };

        tokio::time::timeout(self.query_timeout, exchange)
            .await
            .map_err(|_| {
                PanelError::timeout(self.query_timeout, format!("querying metrics from {}", agent_id))
            })?
    }

    async fn open_shell(
        &self,
        agent_id: &AgentId,
        request: ShellRequest,
    ) -> Result<RemoteShell, PanelError> {
        let conn = self.connection(agent_id)?;
        let stream_id = conn.next_stream_id();
        let (event_tx, events) = mpsc::channel(SHELL_EVENT_BUFFER);
        let ready = conn.await_shell(stream_id, event_tx);
        let mut pending = PendingShell {
            conn: Arc::clone(&conn),
            stream_id,
            armed: true,
        };

        conn.send(AgentCommand::OpenShell { stream_id, request })
            .await?;
        let pid = ready.await.map_err(|_| {
            PanelError::Unreachable(format!("agent {} disconnected", agent_id))
        })??;

        pending.armed = false;
        tracing::info!("Opened shell {} on agent {} (pid {})", stream_id, agent_id, pid);
        Ok(RemoteShell {
            stream_id,
            pid,
            events,
        })
    }

    async fn send_input(
        &self,
        agent_id: &AgentId,
        stream_id: StreamId,
        data: Bytes,
    ) -> Result<(), PanelError> {
        self.connection(agent_id)?
            .send(AgentCommand::Input { stream_id, data })
            .await
    }

    async fn resize_shell(
        &self,
        agent_id: &AgentId,
        stream_id: StreamId,
        size: TerminalSize,
    ) -> Result<(), PanelError> {
        self.connection(agent_id)?
            .send(AgentCommand::Resize { stream_id, size })
            .await
    }

    async fn close_shell(&self, agent_id: &AgentId, stream_id: StreamId) -> Result<(), PanelError> {
        if let Some(conn) = self.pool.get(agent_id) {
            conn.forget_shell(stream_id);
            if !conn.try_send(AgentCommand::CloseShell { stream_id }) {
                tracing::warn!("Could not queue close of {} for agent {}", stream_id, agent_id);
            }
        }
        Ok(())
    }

    async fn disconnect(&self, agent_id: &AgentId) {
        if let Some(conn) = self.pool.remove(agent_id) {
            tracing::info!("Disconnecting agent {}", agent_id);
            conn.cancel.cancel();
            conn.fail_all();
        }
    }
}
