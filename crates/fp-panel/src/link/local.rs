use async_trait::async_trait;

use fp_core::traits::NodeLink;
use fp_core::{probe, ConnectionType, NodeId, PanelError, ResourceSnapshot};

/// The control-plane host itself
pub struct LocalLink {
    node_id: NodeId,
}

impl LocalLink {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

#[async_trait]
impl NodeLink for LocalLink {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Direct
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn probe(&self) -> Result<ResourceSnapshot, PanelError> {
        probe::sample_async().await
    }
}
