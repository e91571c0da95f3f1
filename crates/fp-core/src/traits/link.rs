//! How the control plane reaches one node for health data

use async_trait::async_trait;

use crate::error::PanelError;
use crate::types::{ConnectionType, NodeId, ResourceSnapshot};

/// A resolved path to a node: the local probe, a secure-shell scrape or a
/// tunnel agent
#[async_trait]
pub trait NodeLink: Send + Sync {
    fn node_id(&self) -> &NodeId;

    fn connection_type(&self) -> ConnectionType;

    /// Short label for logs (`local`, `ssh`, `tunnel`)
    fn kind(&self) -> &'static str;

    /// Fetch a current resource snapshot
    async fn probe(&self) -> Result<ResourceSnapshot, PanelError>;
}
