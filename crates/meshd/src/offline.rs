//! Mesh binding for a node with no transport attached.
//!
//! Every data-plane call reports the mesh as unreachable, so the sync engine
//! keeps files staged and the storage manager keeps them local. The control
//! plane still runs: outgoing advertisements and heartbeats are encoded with
//! the gossip codec and logged, and inbound frames (once a transport feeds
//! them in) update the mesh view that candidate storage nodes come from.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_core::config::GossipConfig;
use mesh_core::{
    DistributedFileInfo, MeshError, MeshResult, NodeId, StagedFile, StorageCapabilities,
    StorageOperation,
};
use mesh_gossip::{GossipMessage, GossipOutcome, MeshView, MessageFactory};
use mesh_storage::MeshNetwork;
use mesh_sync::{ConnectivityProbe, MeshTransfer};
use tracing::{debug, info, Span};

pub struct OfflineMesh {
    factory: MessageFactory,
    view: Mutex<MeshView>,
    sequence: AtomicU32,
    started: Instant,
    span: Span,
}

impl OfflineMesh {
    pub fn new(node_id: impl Into<NodeId>, gossip: GossipConfig, span: Span) -> Self {
        let node_id = node_id.into();
        Self {
            factory: MessageFactory::new(node_id.clone()),
            view: Mutex::new(MeshView::new(node_id, gossip, span.clone())),
            sequence: AtomicU32::new(0),
            started: Instant::now(),
            span,
        }
    }

    /// Decode an inbound frame and apply it to the mesh view.
    pub fn receive(&self, frame: &[u8]) -> MeshResult<GossipOutcome> {
        let message = mesh_gossip::decode(frame, 0)?;
        let outcome = self
            .view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(message);
        Ok(outcome)
    }

    /// Encode the next heartbeat frame.
    pub fn heartbeat(&self) -> MeshResult<Bytes> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let uptime = u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.emit(self.factory.heartbeat(sequence, uptime))
    }

    /// Encode a storage advertisement frame for `caps`.
    pub fn advertisement(&self, caps: &StorageCapabilities) -> MeshResult<Bytes> {
        self.emit(self.factory.storage(caps))
    }

    pub fn known_nodes(&self) -> usize {
        self.view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .node_count()
    }

    fn emit(&self, message: GossipMessage) -> MeshResult<Bytes> {
        let frame = mesh_gossip::encode(&message)?;
        debug!(
            parent: &self.span,
            id = %message.id,
            kind = ?message.message_type(),
            bytes = frame.len(),
            "gossip frame ready (no transport)"
        );
        Ok(frame)
    }
}

#[async_trait]
impl MeshNetwork for OfflineMesh {
    async fn send_storage_request(
        &self,
        _node: &str,
        _info: &DistributedFileInfo,
        _operation: StorageOperation,
    ) -> MeshResult<()> {
        Err(MeshError::MeshUnreachable)
    }

    async fn query_file_availability(&self, _path: &str) -> MeshResult<Vec<NodeId>> {
        Ok(Vec::new())
    }

    async fn request_file_from_node(&self, _node: &str, _path: &str) -> MeshResult<Option<Vec<u8>>> {
        Err(MeshError::MeshUnreachable)
    }

    async fn available_storage_nodes(&self) -> MeshResult<Vec<NodeId>> {
        Ok(self
            .view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .storage_nodes())
    }

    async fn broadcast_storage_advertisement(&self, caps: &StorageCapabilities) -> MeshResult<()> {
        let frame = self.advertisement(caps)?;
        info!(
            parent: &self.span,
            offered = caps.offered_bytes,
            used = caps.used_bytes,
            bytes = frame.len(),
            "storage advertisement encoded"
        );
        Ok(())
    }
}

#[async_trait]
impl MeshTransfer for OfflineMesh {
    async fn upload(&self, _file: &StagedFile, _data: &[u8]) -> MeshResult<()> {
        Err(MeshError::MeshUnreachable)
    }

    async fn download(&self, _path: &str) -> MeshResult<Option<Vec<u8>>> {
        Err(MeshError::MeshUnreachable)
    }

    async fn delete(&self, _path: &str) -> MeshResult<()> {
        Err(MeshError::MeshUnreachable)
    }

    async fn remote_checksum(&self, _path: &str) -> MeshResult<Option<String>> {
        Err(MeshError::MeshUnreachable)
    }
}

#[async_trait]
impl ConnectivityProbe for OfflineMesh {
    async fn is_reachable(&self) -> bool {
        false
    }
}
