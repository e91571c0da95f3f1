//! Node links: how a node is reached for a resource snapshot
//!
//! - the local node is probed in-process,
//! - direct remote nodes are scraped over a secure-shell session,
//! - tunnel nodes are asked through their bound agent.

mod local;
mod ssh;
mod tunnel;

pub use local::LocalLink;
pub use ssh::{parse_scrape, SshLink, SCRAPE_COMMAND};
pub use tunnel::TunnelLink;

use std::sync::Arc;
use std::time::Duration;

use fp_core::traits::{AgentRpc, NodeLink, SecureShell};
use fp_core::{ConnectionType, PanelError};

use crate::registry::{Node, NodeRegistry};

/// Resolves the right link for a node record
pub struct LinkFactory {
    registry: Arc<NodeRegistry>,
    ssh: Arc<dyn SecureShell>,
    agents: Arc<dyn AgentRpc>,
    connect_timeout: Duration,
}

impl LinkFactory {
    pub fn new(
        registry: Arc<NodeRegistry>,
        ssh: Arc<dyn SecureShell>,
        agents: Arc<dyn AgentRpc>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ssh,
            agents,
            connect_timeout,
        }
    }

    pub fn link_for(&self, node: &Node) -> Result<Box<dyn NodeLink>, PanelError> {
        if node.is_local {
            return Ok(Box::new(LocalLink::new(node.id.clone())));
        }
        match node.connection_type {
            ConnectionType::Tunnel => Ok(Box::new(TunnelLink::new(
                node.id.clone(),
                node.agent_id.clone(),
                Arc::clone(&self.agents),
            ))),
            ConnectionType::Direct => {
                let target = self.registry.ssh_target(&node.id)?;
                Ok(Box::new(SshLink::new(
                    node.id.clone(),
                    target,
                    Arc::clone(&self.ssh),
                    self.connect_timeout,
                )))
            }
        }
    }
}
