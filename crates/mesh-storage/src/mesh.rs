//! The mesh-network collaborator the storage manager talks to.

use async_trait::async_trait;
use mesh_core::{DistributedFileInfo, MeshResult, NodeId, StorageCapabilities, StorageOperation};

#[async_trait]
pub trait MeshNetwork: Send + Sync {
    /// Ask `node` to replicate or drop the file described by `info`.
    async fn send_storage_request(
        &self,
        node: &str,
        info: &DistributedFileInfo,
        operation: StorageOperation,
    ) -> MeshResult<()>;

    /// Nodes advertising a copy of `path`.
    async fn query_file_availability(&self, path: &str) -> MeshResult<Vec<NodeId>>;

    /// Fetch the stored (sealed) bytes of `path` from `node`.
    async fn request_file_from_node(&self, node: &str, path: &str) -> MeshResult<Option<Vec<u8>>>;

    /// Storage-capable nodes, best candidates first.
    async fn available_storage_nodes(&self) -> MeshResult<Vec<NodeId>>;

    async fn broadcast_storage_advertisement(&self, caps: &StorageCapabilities) -> MeshResult<()>;
}
