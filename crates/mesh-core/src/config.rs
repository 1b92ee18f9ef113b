use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};
use crate::types::{ParticipationConfig, ReplicationLevel};

/// Top-level node configuration (loaded from mesh.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub battery: BatteryConfig,
    pub gossip: GossipConfig,
    pub crypto: CryptoConfig,
}

impl MeshConfig {
    pub fn validate(&self) -> MeshResult<()> {
        self.storage.validate()?;
        self.sync.validate()?;
        self.battery.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Stable node identifier (defaults to a random id on first start)
    pub node_id: Option<String>,
    /// Root of the local staging area
    pub data_dir: PathBuf,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bytes this node offers to the mesh
    pub quota_bytes: u64,
    /// Whether this node replicates to and for peers
    pub participation_enabled: bool,
    pub default_replication: ReplicationLevel,
    /// Upper bound on any single mesh round trip
    pub mesh_timeout_ms: u64,
    pub monitor_interval_secs: u64,
    pub monitor_error_backoff_secs: u64,
    /// Replication health below which a file is re-distributed
    pub health_threshold: f64,
}

impl StorageConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.quota_bytes == 0 {
            return Err(MeshError::Config("storage.quota_bytes must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.health_threshold) {
            return Err(MeshError::Config(format!(
                "storage.health_threshold must be within [0, 1], got {}",
                self.health_threshold
            )));
        }
        if self.monitor_interval_secs == 0 {
            return Err(MeshError::Config(
                "storage.monitor_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn participation(&self) -> ParticipationConfig {
        ParticipationConfig {
            enabled: self.participation_enabled,
            quota_bytes: self.quota_bytes,
            default_replication: self.default_replication,
        }
    }

    pub fn mesh_timeout(&self) -> Duration {
        Duration::from_millis(self.mesh_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations drained per scheduling iteration
    pub batch_size: usize,
    /// Operations executed concurrently within a batch
    pub max_concurrent: usize,
    /// Attempt ceiling before a file is marked sync_failed
    pub max_retries: u32,
    /// Base of the exponential retry delay
    pub retry_base_delay_ms: u64,
    /// Sleep when the queue is empty
    pub idle_backoff_secs: u64,
    /// Sleep when mesh or battery gating skips a tick
    pub gated_backoff_secs: u64,
    /// Sleep after an unexpected scheduling error
    pub error_backoff_secs: u64,
    /// Upper bound on a single upload/download
    pub transfer_timeout_ms: u64,
    /// Connectivity probe interval
    pub connectivity_poll_secs: u64,
}

impl SyncConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.batch_size == 0 {
            return Err(MeshError::Config("sync.batch_size must be > 0".into()));
        }
        if self.max_concurrent == 0 {
            return Err(MeshError::Config("sync.max_concurrent must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(MeshError::Config("sync.max_retries must be > 0".into()));
        }
        Ok(())
    }

    /// `base * 2^attempts`, saturating.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Battery thresholds for the sync gate, in percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// At or above this level sync is unconditionally healthy
    pub allow_threshold: u8,
    /// Below this level (not charging) only critical operations sync
    pub critical_only_threshold: u8,
    /// Below this level (not charging) nothing syncs
    pub deny_threshold: u8,
}

impl BatteryConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if !(self.deny_threshold <= self.critical_only_threshold
            && self.critical_only_threshold <= self.allow_threshold
            && self.allow_threshold <= 100)
        {
            return Err(MeshError::Config(format!(
                "battery thresholds must satisfy deny <= critical_only <= allow <= 100 \
                 (got {} / {} / {})",
                self.deny_threshold, self.critical_only_threshold, self.allow_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Seen-set size before it is cleared
    pub max_seen_messages: usize,
    /// Messages older than this are dropped on receipt
    pub max_message_age_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Path to the raw storage key file (created on first start)
    pub key_file: Option<PathBuf>,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            data_dir: PathBuf::from("~/.local/share/meshstage"),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 1024 * 1024 * 1024,
            participation_enabled: false,
            default_replication: ReplicationLevel::Standard,
            mesh_timeout_ms: 10_000,
            monitor_interval_secs: 30,
            monitor_error_backoff_secs: 60,
            health_threshold: 0.5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 3,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            idle_backoff_secs: 5,
            gated_backoff_secs: 30,
            error_backoff_secs: 10,
            transfer_timeout_ms: 30_000,
            connectivity_poll_secs: 15,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            allow_threshold: 50,
            critical_only_threshold: 30,
            deny_threshold: 15,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_seen_messages: 10_000,
            max_message_age_ms: 300_000,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}
