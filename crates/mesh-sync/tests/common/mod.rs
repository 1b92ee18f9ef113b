//! Shared fixtures: a scripted mesh and an in-memory engine.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mesh_core::checksum::checksum_hex;
use mesh_core::config::{BatteryConfig, SyncConfig};
use mesh_core::{MeshError, MeshResult, StagedFile};
use mesh_sync::{FixedPower, MeshTransfer, SyncQueue};
use opendal::Operator;

/// Failure to inject on the next upload.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transient,
    Permission,
}

/// Mesh fake holding copies in a map, with scriptable upload failures.
#[derive(Default)]
pub struct ScriptedTransfer {
    copies: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<VecDeque<Fault>>,
    fail_all: Mutex<Option<Fault>>,
    pub uploads: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
}

impl ScriptedTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn fail_always(&self, fault: Option<Fault>) {
        *self.fail_all.lock().unwrap() = fault;
    }

    /// Put a copy on the mesh directly, as another node would.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.copies
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn remove(&self, path: &str) {
        self.copies.lock().unwrap().remove(path);
    }

    pub fn copy(&self, path: &str) -> Option<Vec<u8>> {
        self.copies.lock().unwrap().get(path).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn next_fault(&self) -> Option<Fault> {
        if let Some(f) = *self.fail_all.lock().unwrap() {
            return Some(f);
        }
        self.faults.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl MeshTransfer for ScriptedTransfer {
    async fn upload(&self, file: &StagedFile, data: &[u8]) -> MeshResult<()> {
        self.uploads.lock().unwrap().push(file.path.clone());
        match self.next_fault() {
            Some(Fault::Transient) => Err(MeshError::TransientIo("link dropped".into())),
            Some(Fault::Permission) => Err(MeshError::Permission("peer refused".into())),
            None => {
                self.put(&file.path, data);
                Ok(())
            }
        }
    }

    async fn download(&self, path: &str) -> MeshResult<Option<Vec<u8>>> {
        Ok(self.copy(path))
    }

    async fn delete(&self, path: &str) -> MeshResult<()> {
        self.deletes.lock().unwrap().push(path.to_string());
        self.remove(path);
        Ok(())
    }

    async fn remote_checksum(&self, path: &str) -> MeshResult<Option<String>> {
        Ok(self.copy(path).map(|d| checksum_hex(&d)))
    }
}

pub fn memory_operator() -> Operator {
    mesh_sync::local::build_memory_operator().expect("memory operator")
}

/// Config with millisecond retry delays so retry tests run fast.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 1,
        idle_backoff_secs: 1,
        gated_backoff_secs: 1,
        error_backoff_secs: 1,
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub queue: SyncQueue,
    pub mesh: Arc<ScriptedTransfer>,
    pub power: Arc<FixedPower>,
    pub op: Operator,
}

pub async fn harness() -> Harness {
    harness_with(memory_operator(), fast_config()).await
}

pub async fn harness_with(op: Operator, config: SyncConfig) -> Harness {
    let mesh = ScriptedTransfer::new();
    let power = Arc::new(FixedPower::new(100, false));
    let queue = SyncQueue::open(
        op.clone(),
        mesh.clone(),
        power.clone(),
        config,
        BatteryConfig::default(),
        tracing::info_span!("sync-test"),
    )
    .await
    .expect("open sync queue");
    Harness {
        queue,
        mesh,
        power,
        op,
    }
}
