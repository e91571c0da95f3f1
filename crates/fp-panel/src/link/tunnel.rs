use std::sync::Arc;

use async_trait::async_trait;

use fp_core::traits::{AgentRpc, NodeLink};
use fp_core::{AgentId, ConnectionType, NodeId, PanelError, ResourceSnapshot};

/// A node served by a tunnel agent
pub struct TunnelLink {
    node_id: NodeId,
    agent_id: Option<AgentId>,
    agents: Arc<dyn AgentRpc>,
}

impl TunnelLink {
    pub fn new(node_id: NodeId, agent_id: Option<AgentId>, agents: Arc<dyn AgentRpc>) -> Self {
        Self {
            node_id,
            agent_id,
            agents,
        }
    }
}

#[async_trait]
impl NodeLink for TunnelLink {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Tunnel
    }

    fn kind(&self) -> &'static str {
        "tunnel"
    }

    async fn probe(&self) -> Result<ResourceSnapshot, PanelError> {
        let agent_id = self.agent_id.as_ref().ok_or_else(|| {
            PanelError::Unreachable(format!("node {} has no agent deployed", self.node_id))
        })?;
        if !self.agents.is_connected(agent_id) {
            return Err(PanelError::Unreachable(format!(
                "agent {} is not connected",
                agent_id
            )));
        }
        self.agents.query_metrics(agent_id).await
    }
}
