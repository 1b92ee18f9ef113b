//! Shared fixtures: a fake mesh network and a storage node on in-memory storage.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mesh_core::config::{BatteryConfig, StorageConfig, SyncConfig};
use mesh_core::{
    DistributedFileInfo, MeshError, MeshResult, NodeId, StagedFile, StorageCapabilities,
    StorageOperation,
};
use mesh_crypto::{StorageKey, XChaChaEncryptor};
use mesh_storage::{DistributedStorageManager, MeshNetwork};
use mesh_sync::{FixedPower, MeshTransfer, SyncQueue};
use opendal::Operator;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

#[derive(Default)]
pub struct FakeMesh {
    nodes: Mutex<Vec<NodeId>>,
    failing: Mutex<HashSet<NodeId>>,
    /// path → (node, sealed bytes) in advertised order
    holders: Mutex<HashMap<String, Vec<(NodeId, Vec<u8>)>>>,
    pub requests: Mutex<Vec<(NodeId, String, StorageOperation)>>,
    pub adverts: Mutex<Vec<StorageCapabilities>>,
    /// Storage requests wait on a read guard while a write guard is parked
    paused: Arc<RwLock<()>>,
    pause_guard: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl FakeMesh {
    pub fn set_nodes(&self, nodes: &[&str]) {
        *self.nodes.lock().unwrap() = nodes.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_node(&self, node: &str) {
        self.failing.lock().unwrap().insert(node.to_string());
    }

    pub fn hold(&self, node: &str, path: &str, sealed: Vec<u8>) {
        self.holders
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push((node.to_string(), sealed));
    }

    pub fn requests_of(&self, op: StorageOperation) -> Vec<(NodeId, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, o)| *o == op)
            .map(|(n, p, _)| (n.clone(), p.clone()))
            .collect()
    }

    /// Hold every storage request until [`resume`](Self::resume).
    pub fn pause(&self) {
        let guard = self.paused.clone().try_write_owned().expect("not paused yet");
        *self.pause_guard.lock().unwrap() = Some(guard);
    }

    pub fn resume(&self) {
        self.pause_guard.lock().unwrap().take();
    }

    pub fn advert_count(&self) -> usize {
        self.adverts.lock().unwrap().len()
    }
}

#[async_trait]
impl MeshNetwork for FakeMesh {
    async fn send_storage_request(
        &self,
        node: &str,
        info: &DistributedFileInfo,
        operation: StorageOperation,
    ) -> MeshResult<()> {
        let _running = self.paused.read().await;
        if self.failing.lock().unwrap().contains(node) {
            return Err(MeshError::TransientIo(format!("{node} did not answer")));
        }
        self.requests
            .lock()
            .unwrap()
            .push((node.to_string(), info.path.clone(), operation));
        Ok(())
    }

    async fn query_file_availability(&self, path: &str) -> MeshResult<Vec<NodeId>> {
        Ok(self
            .holders
            .lock()
            .unwrap()
            .get(path)
            .map(|h| h.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default())
    }

    async fn request_file_from_node(&self, node: &str, path: &str) -> MeshResult<Option<Vec<u8>>> {
        Ok(self.holders.lock().unwrap().get(path).and_then(|h| {
            h.iter()
                .find(|(n, _)| n == node)
                .map(|(_, bytes)| bytes.clone())
        }))
    }

    async fn available_storage_nodes(&self) -> MeshResult<Vec<NodeId>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn broadcast_storage_advertisement(&self, caps: &StorageCapabilities) -> MeshResult<()> {
        self.adverts.lock().unwrap().push(caps.clone());
        Ok(())
    }
}

/// Transfer for the sync engine underneath; the mesh stays unavailable in
/// these tests so it is never called.
pub struct IdleTransfer;

#[async_trait]
impl MeshTransfer for IdleTransfer {
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

pub fn test_key() -> StorageKey {
    StorageKey::from_bytes([0x42; 32])
}

pub struct TestNode {
    pub manager: DistributedStorageManager,
    pub mesh: Arc<FakeMesh>,
    pub encryptor: Arc<XChaChaEncryptor>,
}

pub fn storage_config(quota_bytes: u64, participation_enabled: bool) -> StorageConfig {
    StorageConfig {
        quota_bytes,
        participation_enabled,
        ..StorageConfig::default()
    }
}

pub async fn node(quota_bytes: u64, participation_enabled: bool) -> TestNode {
    let op = mesh_sync::local::build_memory_operator().expect("memory operator");
    node_on(op, storage_config(quota_bytes, participation_enabled)).await
}

pub async fn node_on(op: Operator, config: StorageConfig) -> TestNode {
    let sync = SyncQueue::open(
        op.clone(),
        Arc::new(IdleTransfer),
        Arc::new(FixedPower::new(100, true)),
        SyncConfig::default(),
        BatteryConfig::default(),
        tracing::Span::none(),
    )
    .await
    .expect("open sync queue");

    let mesh = Arc::new(FakeMesh::default());
    let encryptor = Arc::new(XChaChaEncryptor::new(test_key()));
    let manager = DistributedStorageManager::open(
        "self",
        op,
        sync,
        mesh.clone(),
        encryptor.clone(),
        config,
        tracing::info_span!("storage-test"),
    )
    .await
    .expect("open storage manager");

    TestNode {
        manager,
        mesh,
        encryptor,
    }
}
