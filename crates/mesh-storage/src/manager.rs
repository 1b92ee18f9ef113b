//! Distributed storage manager.
//!
//! Sits above the sync engine: enforces the quota, seals payloads with the
//! encryption collaborator, hands the sealed bytes to [`SyncQueue`] for
//! staging, and, while participation is on, spreads replicas across nodes
//! picked by the mesh. A background monitor recomputes stats, expires
//! unaccessed files and re-distributes files whose replication health falls
//! below the threshold.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use mesh_core::config::StorageConfig;
use mesh_core::{
    unix_millis, AccessPattern, DistributedFileInfo, FileRef, MeshError, MeshResult, NodeId,
    ParticipationConfig, QuotaInfo, ReplicationLevel, StorageCapabilities, StorageFeature,
    StorageOperation, StorageStats, SyncPriority,
};
use mesh_crypto::Encryptor;
use mesh_sync::{DeleteOutcome, SyncQueue};
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use crate::mesh::MeshNetwork;
use crate::quota::QuotaManager;
use crate::replication::ReplicationTracker;

pub const DISTRIBUTED_KEY: &str = "state/distributed.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DistributedDocument {
    version: u32,
    files: Vec<DistributedFileInfo>,
}

/// Pick replication targets: the first `level.replica_count()` nodes in mesh
/// order, skipping `local`. Fewer available nodes means partial replication.
pub fn select_replication_nodes(
    available: &[NodeId],
    level: ReplicationLevel,
    local: &str,
) -> Vec<NodeId> {
    available
        .iter()
        .filter(|n| n.as_str() != local)
        .take(level.replica_count())
        .cloned()
        .collect()
}

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub expired: Vec<String>,
    pub redistributed: Vec<String>,
    pub stats: StorageStats,
}

struct Inner {
    node_id: NodeId,
    sync: SyncQueue,
    network: Arc<dyn MeshNetwork>,
    encryptor: Arc<dyn Encryptor>,
    op: Operator,
    config: StorageConfig,
    participation: RwLock<ParticipationConfig>,
    quota: Mutex<QuotaManager>,
    replication: Mutex<ReplicationTracker>,
    files: Mutex<BTreeMap<String, DistributedFileInfo>>,
    stats: Mutex<StorageStats>,
    /// Serializes metadata writes so an older snapshot never lands last
    persist_lock: tokio::sync::Mutex<()>,
    /// Held across store and delete so quota accounting sees one writer
    write_lock: tokio::sync::Mutex<()>,
    /// path → distribution jobs still running for it
    distributing: Mutex<HashMap<String, usize>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    span: Span,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct DistributedStorageManager {
    inner: Arc<Inner>,
}

impl DistributedStorageManager {
    /// Build the manager over an opened sync engine, reloading distributed
    /// metadata from `op`. Entries whose staged file is gone are dropped.
    pub async fn open(
        node_id: impl Into<NodeId>,
        op: Operator,
        sync: SyncQueue,
        network: Arc<dyn MeshNetwork>,
        encryptor: Arc<dyn Encryptor>,
        config: StorageConfig,
        span: Span,
    ) -> MeshResult<Self> {
        config.validate()?;

        let mut files = load_document(&op).await;
        let mut dropped = 0usize;
        for path in files.keys().cloned().collect::<Vec<_>>() {
            if sync.staged_file(&path).await.is_none() {
                files.remove(&path);
                dropped += 1;
            }
        }

        let mut quota = QuotaManager::new(config.quota_bytes);
        let mut replication = ReplicationTracker::new();
        for info in files.values() {
            quota.charge(info.original_size);
            replication.track_replication(&info.path, info.replica_nodes.iter().cloned());
            for node in &info.replica_nodes {
                replication.confirm_replica(&info.path, node);
            }
        }
        if quota.available() == 0 {
            warn!(parent: &span, used = quota.quota_info().used_quota, "stored files fill the quota");
        }
        info!(parent: &span, files = files.len(), dropped, "storage manager opened");

        let manager = Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                sync,
                network,
                encryptor,
                op,
                participation: RwLock::new(config.participation()),
                config,
                quota: Mutex::new(quota),
                replication: Mutex::new(replication),
                files: Mutex::new(files),
                stats: Mutex::new(StorageStats::default()),
                persist_lock: tokio::sync::Mutex::new(()),
                write_lock: tokio::sync::Mutex::new(()),
                distributing: Mutex::new(HashMap::new()),
                jobs: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                span,
            }),
        };
        manager.refresh_stats();
        if dropped > 0 {
            manager.persist().await?;
        }
        Ok(manager)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn sync_queue(&self) -> &SyncQueue {
        &self.inner.sync
    }

    fn participation(&self) -> ParticipationConfig {
        self.inner
            .participation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Public operations ────────────────────────────────────────────────

    /// Store `data` under `path`.
    ///
    /// The quota check happens before anything is written; on
    /// `QuotaExceeded` nothing changes. The returned reference carries the
    /// caller's payload size, not the sealed size. Concurrent writes run one
    /// at a time.
    pub async fn store_file(
        &self,
        path: &str,
        data: &[u8],
        priority: SyncPriority,
        replication: ReplicationLevel,
    ) -> MeshResult<FileRef> {
        let _write = self.inner.write_lock.lock().await;
        let size = data.len() as u64;
        let previous = lock(&self.inner.files).get(path).cloned();
        let previous_size = previous.as_ref().map_or(0, |f| f.original_size);

        lock(&self.inner.quota).reserve_replacement(previous_size, size)?;

        let staged = match self.seal_and_stage(path, data, priority).await {
            Ok(staged) => staged,
            Err(e) => {
                // undo the reservation
                let mut quota = lock(&self.inner.quota);
                quota.release(size);
                quota.charge(previous_size);
                return Err(e);
            }
        };

        let now = unix_millis();
        let info = DistributedFileInfo {
            path: path.to_string(),
            local: staged.clone(),
            original_size: size,
            replication,
            priority,
            created_at: previous.as_ref().map_or(now, |f| f.created_at),
            last_access: now,
            replica_nodes: Vec::new(),
        };
        lock(&self.inner.files).insert(path.to_string(), info);
        if previous.is_some() {
            // replicas of the old content no longer count
            lock(&self.inner.replication).untrack(path);
        }
        self.persist().await?;

        info!(
            parent: &self.inner.span,
            path,
            size,
            priority = priority.as_str(),
            ?replication,
            "file stored"
        );
        if self.participation().enabled {
            self.spawn_distribution(path.to_string());
        }
        Ok(FileRef { size, ..staged })
    }

    async fn seal_and_stage(&self, path: &str, data: &[u8], priority: SyncPriority) -> MeshResult<FileRef> {
        let sealed = self.inner.encryptor.encrypt(data)?;
        self.inner.sync.store_file(path, &sealed, priority).await
    }

    /// Fetch and decrypt `path`, locally first, then from mesh nodes that
    /// advertise it. Candidates whose bytes do not decrypt are skipped.
    pub async fn retrieve_file(&self, path: &str) -> MeshResult<Vec<u8>> {
        match self.inner.sync.read_file(path).await {
            Ok(sealed) => {
                let touched = match lock(&self.inner.files).get_mut(path) {
                    Some(info) => {
                        info.last_access = unix_millis();
                        true
                    }
                    None => false,
                };
                // retention is measured from last_access, so it must outlive a crash
                if touched {
                    self.persist().await?;
                }
                return self.inner.encryptor.decrypt(&sealed);
            }
            Err(MeshError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !self.participation().enabled {
            return Err(MeshError::NotFound(path.to_string()));
        }

        let candidates = self
            .bounded(self.inner.network.query_file_availability(path))
            .await?;
        debug!(parent: &self.inner.span, path, candidates = candidates.len(), "local miss, asking mesh");

        for node in candidates {
            let sealed = match self
                .bounded(self.inner.network.request_file_from_node(&node, path))
                .await
            {
                Ok(Some(sealed)) => sealed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(parent: &self.inner.span, path, node = %node, error = %e, "mesh fetch failed");
                    continue;
                }
            };
            match self.inner.encryptor.decrypt(&sealed) {
                Ok(plain) => {
                    info!(parent: &self.inner.span, path, node = %node, "retrieved from mesh");
                    return Ok(plain);
                }
                Err(e) => {
                    warn!(parent: &self.inner.span, path, node = %node, error = %e, "payload did not decrypt, trying next node");
                }
            }
        }
        Err(MeshError::NotFound(path.to_string()))
    }

    /// Delete `path` locally and drop its tracking. Replica holders get a
    /// delete request in the background when participation is on.
    ///
    /// Returns whether anything was known about `path`.
    pub async fn delete_file(&self, path: &str) -> MeshResult<bool> {
        let _write = self.inner.write_lock.lock().await;
        let local = self.inner.sync.delete_file(path).await?;

        let info = lock(&self.inner.files).remove(path);
        let holders = lock(&self.inner.replication).untrack(path);
        if let Some(info) = &info {
            lock(&self.inner.quota).release(info.original_size);
        }
        self.persist().await?;

        let known = info.is_some() || local != DeleteOutcome::NotFound;
        if let Some(info) = info {
            if self.participation().enabled && !holders.is_empty() {
                self.spawn_mesh_delete(info, holders);
            }
        }
        if known {
            info!(parent: &self.inner.span, path, "file deleted");
        }
        Ok(known)
    }

    /// Apply a new participation policy. Turning participation on
    /// advertises this node's capabilities right away.
    pub async fn configure_storage_participation(&self, config: ParticipationConfig) -> MeshResult<()> {
        if config.quota_bytes == 0 {
            return Err(MeshError::Config("participation quota must be > 0".into()));
        }
        let was_enabled = {
            let mut current = self
                .inner
                .participation
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            lock(&self.inner.quota).set_total(config.quota_bytes);
            let was = current.enabled;
            *current = config.clone();
            was
        };
        info!(
            parent: &self.inner.span,
            enabled = config.enabled,
            quota = config.quota_bytes,
            "storage participation updated"
        );

        if config.enabled && !was_enabled {
            self.broadcast_capabilities().await;
        }
        Ok(())
    }

    /// Capability descriptor for role assignment and advertisements.
    pub fn get_storage_capabilities(&self) -> StorageCapabilities {
        let participation = self.participation();
        let quota = self.quota_info();
        let health = lock(&self.inner.replication).get_overall_health();
        let (file_count, hot, cold) = {
            let files = lock(&self.inner.files);
            let hot = files
                .values()
                .any(|f| matches!(f.priority, SyncPriority::Critical | SyncPriority::High));
            let cold = files
                .values()
                .filter(|f| f.priority == SyncPriority::Low)
                .count();
            (files.len(), hot, cold)
        };

        let mut features = vec![
            StorageFeature::Encryption,
            StorageFeature::OfflineStaging,
            StorageFeature::ConflictDetection,
        ];
        let mut access_patterns = vec![AccessPattern::OfflineFirst];
        if participation.enabled {
            features.push(StorageFeature::Replication);
        }
        if hot {
            access_patterns.push(AccessPattern::LowLatency);
        }
        if file_count > 0 && cold * 2 > file_count {
            access_patterns.push(AccessPattern::Archival);
        }
        if participation.enabled && quota.available() > 0 {
            access_patterns.push(AccessPattern::ReplicaHost);
        }

        let caps = StorageCapabilities {
            node_id: self.inner.node_id.clone(),
            offered_bytes: quota.total_quota,
            used_bytes: quota.used_quota,
            replication_factor: participation.default_replication.replica_count() as u8,
            file_count,
            replication_health: health,
            participation_enabled: participation.enabled,
            features,
            access_patterns,
        };
        debug!(parent: &self.inner.span, ?caps, "capabilities derived");
        caps
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn list_files(&self) -> Vec<DistributedFileInfo> {
        lock(&self.inner.files).values().cloned().collect()
    }

    pub fn file_info(&self, path: &str) -> Option<DistributedFileInfo> {
        lock(&self.inner.files).get(path).cloned()
    }

    pub fn quota_info(&self) -> QuotaInfo {
        lock(&self.inner.quota).quota_info()
    }

    /// Last computed stats (refreshed by the monitor and by maintenance passes).
    pub fn stats(&self) -> StorageStats {
        lock(&self.inner.stats).clone()
    }

    pub fn replication_health(&self, path: &str) -> Option<f64> {
        lock(&self.inner.replication).get_file_health(path)
    }

    /// External confirmation that `node` holds a replica of `path`.
    pub fn confirm_replica(&self, path: &str, node: &str) -> bool {
        let confirmed = lock(&self.inner.replication).confirm_replica(path, node);
        if confirmed {
            if let Some(info) = lock(&self.inner.files).get_mut(path) {
                if !info.replica_nodes.iter().any(|n| n == node) {
                    info.replica_nodes.push(node.to_string());
                }
            }
        }
        confirmed
    }

    /// External report that `node` lost its replica of `path`.
    pub fn revoke_replica(&self, path: &str, node: &str) -> bool {
        let revoked = lock(&self.inner.replication).revoke_replica(path, node);
        if revoked {
            if let Some(info) = lock(&self.inner.files).get_mut(path) {
                info.replica_nodes.retain(|n| n != node);
            }
        }
        revoked
    }

    // ── Distribution ─────────────────────────────────────────────────────

    fn spawn_distribution(&self, path: String) {
        let slot = DistributionSlot::claim(self.clone(), path);
        let job = async move {
            let (this, path) = (&slot.manager, slot.path.as_str());
            match this.distribute(path).await {
                Ok(n) => debug!(path, replicas = n, "distribution finished"),
                Err(MeshError::Cancelled) => {}
                Err(e) => warn!(path, error = %e, "distribution failed"),
            }
        };
        self.push_job(self.inner.tracker.spawn(job.instrument(self.inner.span.clone())));
    }

    fn distribution_running(&self, path: &str) -> bool {
        lock(&self.inner.distributing).contains_key(path)
    }

    fn spawn_mesh_delete(&self, info: DistributedFileInfo, holders: Vec<NodeId>) {
        let this = self.clone();
        let job = async move {
            for node in holders {
                let req = this.inner.network.send_storage_request(&node, &info, StorageOperation::Delete);
                if let Err(e) = this.bounded(req).await {
                    warn!(path = %info.path, node = %node, error = %e, "mesh delete request failed");
                }
            }
        };
        self.push_job(self.inner.tracker.spawn(job.instrument(self.inner.span.clone())));
    }

    fn push_job(&self, handle: JoinHandle<()>) {
        let mut jobs = lock(&self.inner.jobs);
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Select targets and send a replicate request to each. An accepted
    /// request counts as a confirmed replica.
    async fn distribute(&self, path: &str) -> MeshResult<usize> {
        let Some(info) = self.file_info(path) else {
            return Ok(0);
        };
        let available = self
            .bounded(self.inner.network.available_storage_nodes())
            .await?;
        let targets = select_replication_nodes(&available, info.replication, &self.inner.node_id);
        if targets.len() < info.replication.replica_count() {
            debug!(
                path,
                wanted = info.replication.replica_count(),
                available = targets.len(),
                "partial replication"
            );
        }
        lock(&self.inner.replication).track_replication(path, targets.iter().cloned());

        let mut confirmed = Vec::with_capacity(targets.len());
        for node in &targets {
            let req = self
                .inner
                .network
                .send_storage_request(node, &info, StorageOperation::Replicate);
            match self.bounded(req).await {
                Ok(()) => {
                    lock(&self.inner.replication).confirm_replica(path, node);
                    confirmed.push(node.clone());
                }
                Err(MeshError::Cancelled) => return Err(MeshError::Cancelled),
                Err(e) => warn!(path, node = %node, error = %e, "replication request failed"),
            }
        }

        let count = confirmed.len();
        if let Some(entry) = lock(&self.inner.files).get_mut(path) {
            entry.replica_nodes = confirmed;
        }
        self.persist().await?;
        Ok(count)
    }

    /// Wait for every replication and mesh-delete job issued so far.
    pub async fn wait_for_replication(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = lock(&self.inner.jobs).drain(..).collect();
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(parent: &self.inner.span, error = %e, "replication job panicked");
                }
            }
        }
    }

    async fn broadcast_capabilities(&self) {
        let caps = self.get_storage_capabilities();
        match self
            .bounded(self.inner.network.broadcast_storage_advertisement(&caps))
            .await
        {
            Ok(()) => debug!(parent: &self.inner.span, "capabilities advertised"),
            Err(e) => warn!(parent: &self.inner.span, error = %e, "capability broadcast failed"),
        }
    }

    // ── Monitoring ───────────────────────────────────────────────────────

    fn refresh_stats(&self) -> StorageStats {
        let quota = self.quota_info();
        let stats = StorageStats {
            total_capacity: quota.total_quota,
            used_capacity: quota.used_quota,
            file_count: lock(&self.inner.files).len(),
            replication_health: lock(&self.inner.replication).get_overall_health(),
        };
        *lock(&self.inner.stats) = stats.clone();
        stats
    }

    /// One monitor pass at clock `now_ms`: expire files unaccessed past their
    /// priority's retention, then re-distribute under-replicated files.
    pub async fn run_maintenance_at(&self, now_ms: u64) -> MeshResult<MaintenanceReport> {
        self.refresh_stats();

        let expired: Vec<String> = lock(&self.inner.files)
            .values()
            .filter(|f| {
                f.priority.retention().is_some_and(|ttl| {
                    now_ms.saturating_sub(f.last_access) > ttl.as_millis() as u64
                })
            })
            .map(|f| f.path.clone())
            .collect();
        for path in &expired {
            info!(parent: &self.inner.span, path = %path, "expiring unaccessed file");
            self.delete_file(path).await?;
        }

        let mut redistributed = Vec::new();
        if self.participation().enabled {
            let below = lock(&self.inner.replication).paths_below(self.inner.config.health_threshold);
            for path in below {
                if self.distribution_running(&path) {
                    debug!(parent: &self.inner.span, path = %path, "distribution already running");
                    continue;
                }
                debug!(parent: &self.inner.span, path = %path, "replication health low, redistributing");
                self.spawn_distribution(path.clone());
                redistributed.push(path);
            }
        }

        let stats = self.refresh_stats();
        Ok(MaintenanceReport {
            expired,
            redistributed,
            stats,
        })
    }

    /// Spawn the periodic monitor.
    pub fn start(&self) {
        let this = self.clone();
        let every = Duration::from_secs(self.inner.config.monitor_interval_secs);
        let backoff = Duration::from_secs(self.inner.config.monitor_error_backoff_secs);
        let task = async move {
            info!("storage monitor started");
            let mut pause = every;
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
                pause = match this.run_maintenance_at(unix_millis()).await {
                    Ok(report) => {
                        debug!(
                            expired = report.expired.len(),
                            redistributed = report.redistributed.len(),
                            health = report.stats.replication_health,
                            "maintenance pass"
                        );
                        every
                    }
                    Err(e) => {
                        warn!(error = %e, "maintenance pass failed");
                        backoff
                    }
                };
            }
            info!("storage monitor stopped");
        };
        self.inner
            .tracker
            .spawn(task.instrument(self.inner.span.clone()));
    }

    /// Stop the monitor and outstanding jobs, then the sync engine.
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        lock(&self.inner.jobs).clear();
        self.persist().await?;
        self.inner.sync.shutdown().await?;
        info!(parent: &self.inner.span, "storage manager stopped");
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Bound a mesh call by the mesh timeout and shutdown.
    async fn bounded<T>(&self, fut: impl Future<Output = MeshResult<T>>) -> MeshResult<T> {
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(MeshError::Cancelled),
            res = tokio::time::timeout(self.inner.config.mesh_timeout(), fut) => match res {
                Ok(r) => r,
                Err(_) => Err(MeshError::Timeout("mesh request".into())),
            },
        }
    }

    async fn persist(&self) -> MeshResult<()> {
        let _guard = self.inner.persist_lock.lock().await;
        let doc = DistributedDocument {
            version: FORMAT_VERSION,
            files: lock(&self.inner.files).values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| MeshError::Storage(format!("serializing distributed metadata: {e}")))?;
        self.inner
            .op
            .write(DISTRIBUTED_KEY, json)
            .await
            .map_err(|e| mesh_sync::state::dal_error(e, DISTRIBUTED_KEY))?;
        Ok(())
    }
}

/// Marks a distribution job for its path while the job is alive, however
/// it ends.
struct DistributionSlot {
    manager: DistributedStorageManager,
    path: String,
}

impl DistributionSlot {
    fn claim(manager: DistributedStorageManager, path: String) -> Self {
        *lock(&manager.inner.distributing)
            .entry(path.clone())
            .or_insert(0) += 1;
        Self { manager, path }
    }
}

impl Drop for DistributionSlot {
    fn drop(&mut self) {
        let mut running = lock(&self.manager.inner.distributing);
        let finished = match running.get_mut(&self.path) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if finished {
            running.remove(&self.path);
        }
    }
}

async fn load_document(op: &Operator) -> BTreeMap<String, DistributedFileInfo> {
    match op.read(DISTRIBUTED_KEY).await {
        Ok(buf) => match serde_json::from_slice::<DistributedDocument>(&buf.to_vec()) {
            Ok(doc) if doc.version == FORMAT_VERSION => {
                doc.files.into_iter().map(|f| (f.path.clone(), f)).collect()
            }
            Ok(doc) => {
                warn!(version = doc.version, "unknown distributed metadata format, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(error = %e, "corrupt distributed metadata, starting empty");
                BTreeMap::new()
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => {
            warn!(error = %e, "distributed metadata unreadable, starting empty");
            BTreeMap::new()
        }
    }
}
