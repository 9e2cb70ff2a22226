use async_trait::async_trait;

use crate::node::NodeId;

/// Trait for adding and removing worker capacity.
///
/// A provisioned node joins the pool by registering itself with the
/// coordinator; `provision` only has to start it.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Request one additional node and return the id it will register with.
    async fn provision(&self) -> anyhow::Result<NodeId>;
    /// Tear down a drained node.
    async fn retire(&self, node_id: &NodeId) -> anyhow::Result<()>;
}
