//! Staged-file store: the authoritative map of logical path → [`StagedFile`].
//!
//! Metadata is held in memory and persisted as one JSON document at
//! `state/staged.json`; blob bytes live beside it at `blobs/<blake3(path)>`.
//! Both go through the same OpenDAL operator.
//!
//! Deleting a file the mesh already holds leaves a tombstone in the same
//! document, so the mesh DELETE is retried after a restart until it lands.
//!
//! A missing document means a fresh node. A corrupt one is logged and
//! replaced by empty state: losing the index is preferable to refusing to
//! start, and the blobs themselves are untouched.

use std::collections::BTreeMap;

use mesh_core::{FileState, MeshError, MeshResult, StagedFile};
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const STATE_KEY: &str = "state/staged.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StagedDocument {
    version: u32,
    files: Vec<StagedFile>,
    /// Mesh deletes not yet acknowledged
    #[serde(default)]
    pending_deletes: Vec<StagedFile>,
}

fn by_path(files: Vec<StagedFile>) -> BTreeMap<String, StagedFile> {
    files.into_iter().map(|f| (f.path.clone(), f)).collect()
}

pub struct StagedFileStore {
    op: Operator,
    entries: BTreeMap<String, StagedFile>,
    tombstones: BTreeMap<String, StagedFile>,
    /// Whether there are unsaved changes
    dirty: bool,
}

impl StagedFileStore {
    /// Load the metadata document, falling back to empty state.
    pub async fn open(op: Operator) -> Self {
        let (entries, tombstones) = match op.read(STATE_KEY).await {
            Ok(buf) => match serde_json::from_slice::<StagedDocument>(&buf.to_vec()) {
                Ok(doc) if doc.version == FORMAT_VERSION => {
                    (by_path(doc.files), by_path(doc.pending_deletes))
                }
                Ok(doc) => {
                    warn!(version = doc.version, "unknown staged-file format, starting empty");
                    Default::default()
                }
                Err(e) => {
                    warn!(error = %e, "corrupt staged-file metadata, starting empty");
                    Default::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Default::default(),
            Err(e) => {
                warn!(error = %e, "staged-file metadata unreadable, starting empty");
                Default::default()
            }
        };

        debug!(
            files = entries.len(),
            pending_deletes = tombstones.len(),
            "staged-file store loaded"
        );
        Self {
            op,
            entries,
            tombstones,
            dirty: false,
        }
    }

    pub fn get(&self, path: &str) -> Option<&StagedFile> {
        self.entries.get(path)
    }

    /// Insert or replace the entry for `file.path`.
    pub fn insert(&mut self, file: StagedFile) -> Option<StagedFile> {
        self.dirty = true;
        self.entries.insert(file.path.clone(), file)
    }

    pub fn remove(&mut self, path: &str) -> Option<StagedFile> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Apply `f` to the entry for `path`, returning the updated snapshot.
    pub fn update(&mut self, path: &str, f: impl FnOnce(&mut StagedFile)) -> Option<StagedFile> {
        let entry = self.entries.get_mut(path)?;
        f(entry);
        self.dirty = true;
        Some(entry.clone())
    }

    pub fn set_state(&mut self, path: &str, state: FileState) -> Option<StagedFile> {
        self.update(path, |f| f.state = state)
    }

    pub fn files(&self) -> impl Iterator<Item = &StagedFile> {
        self.entries.values()
    }

    pub fn in_state(&self, states: &[FileState]) -> Vec<StagedFile> {
        self.entries
            .values()
            .filter(|f| states.contains(&f.state))
            .cloned()
            .collect()
    }

    // ── Pending mesh deletes ─────────────────────────────────────────────

    /// Remember that the mesh copy of `file.path` still has to be deleted.
    pub fn add_tombstone(&mut self, file: StagedFile) {
        self.dirty = true;
        self.tombstones.insert(file.path.clone(), file);
    }

    pub fn remove_tombstone(&mut self, path: &str) -> bool {
        let removed = self.tombstones.remove(path).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn tombstones(&self) -> Vec<StagedFile> {
        self.tombstones.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the metadata document if anything changed.
    pub async fn flush(&mut self) -> MeshResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let doc = StagedDocument {
            version: FORMAT_VERSION,
            files: self.entries.values().cloned().collect(),
            pending_deletes: self.tombstones.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| MeshError::Storage(format!("serializing staged-file metadata: {e}")))?;
        self.op
            .write(STATE_KEY, json)
            .await
            .map_err(|e| dal_error(e, STATE_KEY))?;
        self.dirty = false;
        Ok(())
    }

    // ── Blob bytes ───────────────────────────────────────────────────────

    pub async fn write_blob(&self, key: &str, data: &[u8]) -> MeshResult<()> {
        self.op
            .write(key, data.to_vec())
            .await
            .map(|_| ())
            .map_err(|e| dal_error(e, key))
    }

    pub async fn read_blob(&self, key: &str) -> MeshResult<Vec<u8>> {
        self.op
            .read(key)
            .await
            .map(|buf| buf.to_vec())
            .map_err(|e| dal_error(e, key))
    }

    /// Delete a blob; a blob that is already gone is not an error.
    pub async fn delete_blob(&self, key: &str) -> MeshResult<()> {
        match self.op.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(dal_error(e, key)),
        }
    }
}

/// Map an OpenDAL failure onto the shared taxonomy.
pub fn dal_error(e: opendal::Error, key: &str) -> MeshError {
    match e.kind() {
        ErrorKind::NotFound => MeshError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => MeshError::Permission(format!("{key}: {e}")),
        _ if e.is_temporary() => MeshError::TransientIo(format!("{key}: {e}")),
        _ => MeshError::Storage(format!("{key}: {e}")),
    }
}
