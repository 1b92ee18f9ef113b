//! Narrow mesh-transfer interface the sync worker depends on.
//!
//! The queue never talks to the storage manager; it only moves bytes for a
//! logical path through whatever implements [`MeshTransfer`].

use async_trait::async_trait;
use mesh_core::checksum::{blob_key, checksum_hex};
use mesh_core::{MeshError, MeshResult, StagedFile};
use opendal::{ErrorKind, Operator};

use crate::state::dal_error;

#[async_trait]
pub trait MeshTransfer: Send + Sync {
    /// Push the staged bytes of `file` to the mesh.
    async fn upload(&self, file: &StagedFile, data: &[u8]) -> MeshResult<()>;

    /// Fetch the mesh copy of `path`, `None` if no node has it.
    async fn download(&self, path: &str) -> MeshResult<Option<Vec<u8>>>;

    /// Remove the mesh copy of `path`.
    async fn delete(&self, path: &str) -> MeshResult<()>;

    /// Checksum of the mesh copy, `None` if no node has it.
    async fn remote_checksum(&self, path: &str) -> MeshResult<Option<String>>;
}

/// Reachability check polled by the connectivity monitor.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Transfer backed by an OpenDAL operator standing in for the mesh
/// (a gateway node's shared store, or an in-memory store in tests).
///
/// Layout: `<prefix>/<blake3(path)>` holds the bytes and
/// `<prefix>/<blake3(path)>.b3` their checksum.
pub struct DalTransfer {
    op: Operator,
    prefix: String,
}

impl DalTransfer {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn data_key(&self, path: &str) -> String {
        // blob_key is "blobs/<hex>"; keep only the digest
        let key = blob_key(path);
        let digest = key.trim_start_matches("blobs/");
        format!("{}/{}", self.prefix, digest)
    }

    fn sum_key(&self, path: &str) -> String {
        format!("{}.b3", self.data_key(path))
    }

    async fn read_opt(&self, key: &str) -> MeshResult<Option<Vec<u8>>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(dal_error(e, key)),
        }
    }
}

#[async_trait]
impl MeshTransfer for DalTransfer {
    async fn upload(&self, file: &StagedFile, data: &[u8]) -> MeshResult<()> {
        let data_key = self.data_key(&file.path);
        self.op
            .write(&data_key, data.to_vec())
            .await
            .map_err(|e| dal_error(e, &data_key))?;
        let sum_key = self.sum_key(&file.path);
        self.op
            .write(&sum_key, checksum_hex(data).into_bytes())
            .await
            .map_err(|e| dal_error(e, &sum_key))?;
        Ok(())
    }

    async fn download(&self, path: &str) -> MeshResult<Option<Vec<u8>>> {
        self.read_opt(&self.data_key(path)).await
    }

    async fn delete(&self, path: &str) -> MeshResult<()> {
        for key in [self.data_key(path), self.sum_key(path)] {
            match self.op.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(dal_error(e, &key)),
            }
        }
        Ok(())
    }

    async fn remote_checksum(&self, path: &str) -> MeshResult<Option<String>> {
        match self.read_opt(&self.sum_key(path)).await? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| MeshError::Decode(format!("checksum for {path} is not UTF-8"))),
            None => Ok(None),
        }
    }
}
