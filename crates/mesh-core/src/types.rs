use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a mesh node (its stable virtual address).
pub type NodeId = String;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of a staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Stored locally, never handed to the mesh
    LocalOnly,
    /// Queued for upload
    Staging,
    /// Transmission in progress
    Syncing,
    /// Mesh copy matches the local copy
    Synced,
    /// Upload gave up after the retry ceiling (or a terminal error)
    SyncFailed,
    /// Known on the mesh, no local bytes yet
    MeshOnly,
    /// Local and mesh content diverge
    Conflict,
}

impl FileState {
    /// States that count as pending mesh work.
    pub fn is_pending(&self) -> bool {
        matches!(self, FileState::Staging | FileState::Syncing)
    }

    /// Whether the local storage holds the file's bytes.
    pub fn has_local_copy(&self) -> bool {
        !matches!(self, FileState::MeshOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::LocalOnly => "local_only",
            FileState::Staging => "staging",
            FileState::Syncing => "syncing",
            FileState::Synced => "synced",
            FileState::SyncFailed => "sync_failed",
            FileState::MeshOnly => "mesh_only",
            FileState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync / retention priority of a stored file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl SyncPriority {
    /// How long a file may go unaccessed before the monitor expires it.
    /// `None` means it never expires.
    pub fn retention(&self) -> Option<Duration> {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            SyncPriority::Critical => None,
            SyncPriority::High => Some(Duration::from_secs(30 * DAY)),
            SyncPriority::Normal => Some(Duration::from_secs(7 * DAY)),
            SyncPriority::Low => Some(Duration::from_secs(DAY)),
        }
    }

    /// Normal and Low share a queue tier.
    pub fn is_normal_or_lower(&self) -> bool {
        matches!(self, SyncPriority::Normal | SyncPriority::Low)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPriority::Critical => "critical",
            SyncPriority::High => "high",
            SyncPriority::Normal => "normal",
            SyncPriority::Low => "low",
        }
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired redundancy of a distributed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationLevel {
    Minimal,
    #[default]
    Standard,
    High,
    Critical,
}

impl ReplicationLevel {
    pub fn replica_count(&self) -> usize {
        match self {
            ReplicationLevel::Minimal => 1,
            ReplicationLevel::Standard => 3,
            ReplicationLevel::High => 5,
            ReplicationLevel::Critical => 7,
        }
    }
}

/// Kind of queued sync work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Download,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// One locally staged unit of data, keyed by logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// Logical path (unique key)
    pub path: String,
    /// Key of the blob in local storage
    pub local_path: String,
    /// Size of the staged bytes
    pub size: u64,
    pub state: FileState,
    pub priority: SyncPriority,
    /// Unix ms of the last local write
    pub last_modified: u64,
    /// Consecutive failed upload attempts
    pub retry_count: u32,
    /// BLAKE3 hex of the staged bytes
    pub checksum: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StagedFile {
    pub fn file_ref(&self) -> FileRef {
        FileRef {
            path: self.path.clone(),
            size: self.size,
            checksum: self.checksum.clone(),
            state: self.state,
        }
    }
}

/// Reference handed back to callers after a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub state: FileState,
}

/// Mesh-level metadata layered over a staged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedFileInfo {
    pub path: String,
    /// The local staged copy (encrypted bytes)
    pub local: FileRef,
    /// Size of the caller's payload before encryption
    pub original_size: u64,
    pub replication: ReplicationLevel,
    pub priority: SyncPriority,
    pub created_at: u64,
    pub last_access: u64,
    /// Nodes confirmed to hold a replica
    pub replica_nodes: Vec<NodeId>,
}

/// Request sent to a remote node about a distributed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOperation {
    Replicate,
    Delete,
}

/// Aggregate storage statistics, recomputed by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub file_count: usize,
    /// Mean replication health across tracked files, in [0, 1]
    pub replication_health: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub total_quota: u64,
    pub used_quota: u64,
}

impl QuotaInfo {
    pub fn available(&self) -> u64 {
        self.total_quota.saturating_sub(self.used_quota)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFeature {
    Encryption,
    Replication,
    OfflineStaging,
    ConflictDetection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    /// Files are kept locally and synced opportunistically
    OfflineFirst,
    /// High-priority content present; keep reads local
    LowLatency,
    /// Mostly low-priority content; suitable for cold replicas
    Archival,
    /// Node accepts replicas from peers
    ReplicaHost,
}

/// Capability descriptor consumed by role assignment and advertised on the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCapabilities {
    pub node_id: NodeId,
    pub offered_bytes: u64,
    pub used_bytes: u64,
    pub replication_factor: u8,
    pub file_count: usize,
    pub replication_health: f64,
    pub participation_enabled: bool,
    pub features: Vec<StorageFeature>,
    pub access_patterns: Vec<AccessPattern>,
}

impl StorageCapabilities {
    pub fn available_bytes(&self) -> u64 {
        self.offered_bytes.saturating_sub(self.used_bytes)
    }
}

/// Runtime storage participation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationConfig {
    pub enabled: bool,
    pub quota_bytes: u64,
    pub default_replication: ReplicationLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_counts() {
        assert_eq!(ReplicationLevel::Minimal.replica_count(), 1);
        assert_eq!(ReplicationLevel::Standard.replica_count(), 3);
        assert_eq!(ReplicationLevel::High.replica_count(), 5);
        assert_eq!(ReplicationLevel::Critical.replica_count(), 7);
    }

    #[test]
    fn retention_by_priority() {
        assert!(SyncPriority::Critical.retention().is_none());
        assert_eq!(
            SyncPriority::Low.retention(),
            Some(Duration::from_secs(86_400))
        );
        assert!(SyncPriority::High.retention() > SyncPriority::Normal.retention());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json_like(FileState::SyncFailed);
        assert_eq!(json, "sync_failed");
        assert!(!FileState::MeshOnly.has_local_copy());
        assert!(FileState::Syncing.is_pending());
        assert!(!FileState::Synced.is_pending());
    }

    fn serde_json_like(state: FileState) -> String {
        #[derive(Serialize)]
        struct Wrap {
            state: FileState,
        }
        let s = toml::to_string(&Wrap { state }).unwrap();
        s.trim()
            .trim_start_matches("state = ")
            .trim_matches('"')
            .to_string()
    }
}
