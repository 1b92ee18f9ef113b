//! The sync engine: staged-file store, priority queue and battery-gated worker.
//!
//! Every mutation of the staged-file map goes through one async mutex; the
//! operation queue sits behind a plain mutex that is never held across an
//! await. The worker, the connectivity monitor and every in-flight transfer
//! are tracked by one [`TaskTracker`] whose cancellation token is the
//! supervising scope torn down by [`SyncQueue::shutdown`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mesh_core::checksum::{blob_key, checksum_hex, verify};
use mesh_core::config::{BatteryConfig, SyncConfig};
use mesh_core::{
    unix_millis, FileRef, FileState, MeshError, MeshResult, OperationKind, StagedFile,
    SyncPriority,
};
use opendal::Operator;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use crate::battery::{BatteryPolicy, GateDecision, PowerSource};
use crate::conflict::{self, ReconcileOutcome, Resolution, DETECTED_AT_KEY, MESH_CHECKSUM_KEY};
use crate::queue::{OperationQueue, SyncHandle, SyncOperation, SyncResult};
use crate::state::StagedFileStore;
use crate::transfer::{ConnectivityProbe, MeshTransfer};

/// Result of [`SyncQueue::delete_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { mesh_delete_queued: bool },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MeshUnavailable,
    BatteryDeny,
    ShuttingDown,
}

/// What one scheduling iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Idle,
    Processed { count: usize },
}

enum UploadOutcome {
    Synced,
    /// The file was rewritten while the upload was in flight
    Restaged,
    Vanished,
}

struct Inner {
    store: tokio::sync::Mutex<StagedFileStore>,
    queue: Mutex<OperationQueue>,
    transfer: Arc<dyn MeshTransfer>,
    power: Arc<dyn PowerSource>,
    policy: BatteryPolicy,
    config: SyncConfig,
    mesh_available: AtomicBool,
    active: AtomicUsize,
    /// Cancelled and replaced whenever the mesh goes away
    transfers: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    wake: Notify,
    span: Span,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, OperationQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transfer_token(&self) -> CancellationToken {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cancel_transfers(&self) {
        let mut token = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = self.shutdown.child_token();
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Local-first staging with background mesh sync.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Inner>,
}

impl SyncQueue {
    /// Open the engine over `op`, reloading staged-file state from it.
    ///
    /// The mesh starts out unavailable; call [`set_mesh_available`] or
    /// [`spawn_connectivity_monitor`] once a transport is up.
    ///
    /// [`set_mesh_available`]: SyncQueue::set_mesh_available
    /// [`spawn_connectivity_monitor`]: SyncQueue::spawn_connectivity_monitor
    pub async fn open(
        op: Operator,
        transfer: Arc<dyn MeshTransfer>,
        power: Arc<dyn PowerSource>,
        config: SyncConfig,
        battery: BatteryConfig,
        span: Span,
    ) -> MeshResult<Self> {
        config.validate()?;
        battery.validate()?;

        let store = StagedFileStore::open(op).await;
        info!(parent: &span, files = store.len(), "sync queue opened");

        let shutdown = CancellationToken::new();
        let transfers = shutdown.child_token();
        Ok(Self {
            inner: Arc::new(Inner {
                store: tokio::sync::Mutex::new(store),
                queue: Mutex::new(OperationQueue::new()),
                transfer,
                power,
                policy: BatteryPolicy::new(battery),
                config,
                mesh_available: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                transfers: Mutex::new(transfers),
                shutdown,
                tracker: TaskTracker::new(),
                wake: Notify::new(),
                span,
            }),
        })
    }

    /// Spawn the background worker.
    pub fn start(&self) {
        let this = self.clone();
        self.inner
            .tracker
            .spawn(async move { this.run_worker().await }.instrument(self.inner.span.clone()));
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    // ── File operations ──────────────────────────────────────────────────

    /// Stage `data` under `path`, replacing any earlier version.
    ///
    /// The bytes are persisted before this returns. An upload is queued only
    /// when the mesh is reachable and the battery gate admits `priority`;
    /// otherwise the file waits as LOCAL_ONLY for the next sweep.
    pub async fn store_file(
        &self,
        path: &str,
        data: &[u8],
        priority: SyncPriority,
    ) -> MeshResult<FileRef> {
        let local_path = blob_key(path);
        let mut file = StagedFile {
            path: path.to_string(),
            local_path,
            size: data.len() as u64,
            state: FileState::LocalOnly,
            priority,
            last_modified: unix_millis(),
            retry_count: 0,
            checksum: checksum_hex(data),
            metadata: Default::default(),
        };

        let previous = {
            let mut store = self.inner.store.lock().await;
            store.write_blob(&file.local_path, data).await?;
            self.supersede(path);
            // the upload overwrites the mesh copy a pending delete targets
            store.remove_tombstone(path);
            let previous = store.insert(file.clone()).map(|f| f.state);
            store.flush().await?;
            previous
        };

        let kind = match previous {
            Some(FileState::Synced | FileState::Conflict) => OperationKind::Update,
            _ => OperationKind::Upload,
        };
        if self.is_mesh_available() && self.gate().permits(priority) {
            self.enqueue(file.clone(), kind).await?;
            file.state = FileState::Staging;
        }

        debug!(
            parent: &self.inner.span,
            path,
            size = file.size,
            state = file.state.as_str(),
            "file staged"
        );
        Ok(file.file_ref())
    }

    /// Read the bytes for `path`. MESH_ONLY files are fetched from the mesh,
    /// cached locally and promoted to SYNCED.
    pub async fn read_file(&self, path: &str) -> MeshResult<Vec<u8>> {
        let file = {
            let store = self.inner.store.lock().await;
            let file = store
                .get(path)
                .cloned()
                .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
            if file.state != FileState::MeshOnly {
                return store.read_blob(&file.local_path).await;
            }
            file
        };

        if !self.is_mesh_available() {
            return Err(MeshError::MeshUnreachable);
        }
        let cancel = self.inner.transfer_token();
        let data = self.fetch_from_mesh(&file, &cancel).await?;
        self.cache_mesh_copy(path, &data, file.priority).await?;
        Ok(data)
    }

    /// Remove the local copy. SYNCED (or CONFLICT) files also get a mesh
    /// DELETE queued, which runs once the mesh is reachable. The pending
    /// delete is persisted and re-queued after a restart until it succeeds.
    pub async fn delete_file(&self, path: &str) -> MeshResult<DeleteOutcome> {
        let (removed, mesh_delete_queued) = {
            let mut store = self.inner.store.lock().await;
            let Some(file) = store.get(path).cloned() else {
                return Ok(DeleteOutcome::NotFound);
            };
            store.delete_blob(&file.local_path).await?;
            self.supersede(path);
            store.remove(path);
            let mesh_held = matches!(file.state, FileState::Synced | FileState::Conflict);
            if mesh_held {
                store.add_tombstone(file.clone());
            }
            store.flush().await?;
            (file, mesh_held)
        };

        if mesh_delete_queued {
            self.enqueue(removed, OperationKind::Delete).await?;
        }
        info!(parent: &self.inner.span, path, mesh_delete_queued, "file deleted");
        Ok(DeleteOutcome::Deleted { mesh_delete_queued })
    }

    /// Upload `path` right now, outside the queue. Fails fast when the mesh
    /// is unreachable; any other failure marks the file SYNC_FAILED.
    pub async fn force_sync_file(&self, path: &str) -> MeshResult<FileRef> {
        if !self.is_mesh_available() {
            return Err(MeshError::MeshUnreachable);
        }
        match self.staged_file(path).await {
            None => return Err(MeshError::NotFound(path.to_string())),
            Some(f) if f.state == FileState::MeshOnly => {
                return Err(MeshError::InvalidState(format!("{path} has no local copy")))
            }
            Some(_) => {}
        }
        self.supersede(path);

        let cancel = self.inner.transfer_token();
        let result = {
            let _active = ActiveGuard::new(&self.inner.active);
            self.upload_once(path, &cancel).await
        };
        match result {
            Ok(UploadOutcome::Vanished) => Err(MeshError::NotFound(path.to_string())),
            Ok(_) => {
                info!(parent: &self.inner.span, path, "forced sync completed");
                self.staged_file(path)
                    .await
                    .map(|f| f.file_ref())
                    .ok_or_else(|| MeshError::NotFound(path.to_string()))
            }
            Err(e) => {
                let mut store = self.inner.store.lock().await;
                store.update(path, |f| {
                    f.state = FileState::SyncFailed;
                    f.retry_count = f.retry_count.saturating_add(1);
                });
                if let Err(fe) = store.flush().await {
                    warn!(parent: &self.inner.span, error = %fe, "persisting staged-file state failed");
                }
                warn!(parent: &self.inner.span, path, error = %e, "forced sync failed");
                Err(e)
            }
        }
    }

    /// Register a file discovered on the mesh that has no local copy yet.
    pub async fn import_mesh_file(
        &self,
        path: &str,
        size: u64,
        checksum: &str,
        priority: SyncPriority,
    ) -> MeshResult<FileRef> {
        let mut store = self.inner.store.lock().await;
        if let Some(existing) = store.get(path) {
            if existing.state.has_local_copy() {
                return Err(MeshError::InvalidState(format!(
                    "{path} already has a local copy ({})",
                    existing.state.as_str()
                )));
            }
        }
        let file = StagedFile {
            path: path.to_string(),
            local_path: blob_key(path),
            size,
            state: FileState::MeshOnly,
            priority,
            last_modified: unix_millis(),
            retry_count: 0,
            checksum: checksum.to_string(),
            metadata: Default::default(),
        };
        store.insert(file.clone());
        store.flush().await?;
        debug!(parent: &self.inner.span, path, size, "mesh file registered");
        Ok(file.file_ref())
    }

    /// Queue a background fetch of a MESH_ONLY file.
    pub async fn prefetch_file(&self, path: &str) -> MeshResult<SyncHandle> {
        let file = self
            .staged_file(path)
            .await
            .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
        if file.state != FileState::MeshOnly {
            return Err(MeshError::InvalidState(format!(
                "{path} is {}, not mesh_only",
                file.state.as_str()
            )));
        }
        self.enqueue(file, OperationKind::Download).await
    }

    /// Persist bytes fetched from the mesh as a SYNCED local copy.
    pub async fn cache_mesh_copy(
        &self,
        path: &str,
        data: &[u8],
        priority: SyncPriority,
    ) -> MeshResult<FileRef> {
        let file = StagedFile {
            path: path.to_string(),
            local_path: blob_key(path),
            size: data.len() as u64,
            state: FileState::Synced,
            priority,
            last_modified: unix_millis(),
            retry_count: 0,
            checksum: checksum_hex(data),
            metadata: Default::default(),
        };
        let mut store = self.inner.store.lock().await;
        store.write_blob(&file.local_path, data).await?;
        self.supersede(path);
        store.insert(file.clone());
        store.flush().await?;
        Ok(file.file_ref())
    }

    // ── Reconciliation ───────────────────────────────────────────────────

    /// Compare the local checksum of a SYNCED file with the mesh copy.
    ///
    /// A mismatch marks the file CONFLICT; the local copy keeps being served.
    /// A vanished mesh copy sends the file back to LOCAL_ONLY and re-queues it.
    pub async fn reconcile(&self, path: &str) -> MeshResult<ReconcileOutcome> {
        let file = self
            .staged_file(path)
            .await
            .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
        if file.state != FileState::Synced {
            return Ok(ReconcileOutcome::Skipped(file.state));
        }
        if !self.is_mesh_available() {
            return Err(MeshError::MeshUnreachable);
        }

        let cancel = self.inner.transfer_token();
        let remote = self
            .bounded("checksum query", path, &cancel, self.inner.transfer.remote_checksum(path))
            .await?;
        let outcome = conflict::compare(&file.checksum, remote.as_deref());

        match &outcome {
            ReconcileOutcome::InSync | ReconcileOutcome::Skipped(_) => {}
            ReconcileOutcome::Conflict { local, mesh } => {
                let mut store = self.inner.store.lock().await;
                store.update(path, |f| {
                    if f.state == FileState::Synced && &f.checksum == local {
                        f.state = FileState::Conflict;
                        f.metadata.insert(MESH_CHECKSUM_KEY.into(), mesh.clone());
                        f.metadata.insert(DETECTED_AT_KEY.into(), unix_millis().to_string());
                    }
                });
                store.flush().await?;
                warn!(parent: &self.inner.span, path, local = %local, mesh = %mesh, "conflict detected");
            }
            ReconcileOutcome::MeshMissing => {
                let requeue = {
                    let mut store = self.inner.store.lock().await;
                    let updated = store.update(path, |f| {
                        if f.state == FileState::Synced {
                            f.state = FileState::LocalOnly;
                        }
                    });
                    store.flush().await?;
                    updated
                };
                info!(parent: &self.inner.span, path, "mesh copy missing, re-uploading");
                if let Some(f) = requeue.filter(|f| self.gate().permits(f.priority)) {
                    self.enqueue(f, OperationKind::Upload).await?;
                }
            }
        }
        Ok(outcome)
    }

    /// Reconcile every SYNCED file.
    pub async fn reconcile_all(&self) -> MeshResult<Vec<(String, ReconcileOutcome)>> {
        let synced = {
            let store = self.inner.store.lock().await;
            store.in_state(&[FileState::Synced])
        };
        let mut outcomes = Vec::with_capacity(synced.len());
        for file in synced {
            let outcome = self.reconcile(&file.path).await?;
            outcomes.push((file.path, outcome));
        }
        Ok(outcomes)
    }

    /// Settle a CONFLICT in favour of one side.
    pub async fn resolve_conflict(&self, path: &str, resolution: Resolution) -> MeshResult<FileRef> {
        let file = self
            .staged_file(path)
            .await
            .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
        if file.state != FileState::Conflict {
            return Err(MeshError::InvalidState(format!(
                "{path} is {}, not in conflict",
                file.state.as_str()
            )));
        }

        info!(parent: &self.inner.span, path, ?resolution, "resolving conflict");
        match resolution {
            Resolution::KeepLocal => {
                let file = {
                    let mut store = self.inner.store.lock().await;
                    let updated = store
                        .update(path, |f| {
                            f.state = FileState::LocalOnly;
                            f.retry_count = 0;
                            f.metadata.remove(MESH_CHECKSUM_KEY);
                            f.metadata.remove(DETECTED_AT_KEY);
                        })
                        .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
                    store.flush().await?;
                    updated
                };
                self.enqueue(file.clone(), OperationKind::Update).await?;
                Ok(FileRef {
                    state: FileState::Staging,
                    ..file.file_ref()
                })
            }
            Resolution::KeepMesh => {
                if !self.is_mesh_available() {
                    return Err(MeshError::MeshUnreachable);
                }
                let cancel = self.inner.transfer_token();
                let data = self
                    .bounded("download", path, &cancel, self.inner.transfer.download(path))
                    .await?
                    .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
                self.cache_mesh_copy(path, &data, file.priority).await
            }
        }
    }

    /// Give a SYNC_FAILED file a fresh set of attempts.
    pub async fn retry_failed(&self, path: &str) -> MeshResult<SyncHandle> {
        let file = {
            let mut store = self.inner.store.lock().await;
            match store.get(path).map(|f| f.state) {
                None => return Err(MeshError::NotFound(path.to_string())),
                Some(FileState::SyncFailed) => {}
                Some(state) => {
                    return Err(MeshError::InvalidState(format!(
                        "{path} is {}, not sync_failed",
                        state.as_str()
                    )))
                }
            }
            let updated = store
                .update(path, |f| {
                    f.retry_count = 0;
                    f.state = FileState::LocalOnly;
                })
                .ok_or_else(|| MeshError::NotFound(path.to_string()))?;
            store.flush().await?;
            updated
        };
        self.enqueue(file, OperationKind::Upload).await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn file_state(&self, path: &str) -> Option<FileState> {
        self.inner.store.lock().await.get(path).map(|f| f.state)
    }

    pub async fn staged_file(&self, path: &str) -> Option<StagedFile> {
        self.inner.store.lock().await.get(path).cloned()
    }

    pub async fn list_files(&self) -> Vec<StagedFile> {
        self.inner.store.lock().await.files().cloned().collect()
    }

    /// Operations waiting in the queue.
    pub fn pending_sync_count(&self) -> usize {
        self.inner.queue().len()
    }

    /// Operations currently being transmitted.
    pub fn active_sync_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Queued paths in execution order.
    pub fn queued_paths(&self) -> Vec<String> {
        self.inner.queue().paths()
    }

    pub fn is_mesh_available(&self) -> bool {
        self.inner.mesh_available.load(Ordering::SeqCst)
    }

    /// Current battery gate decision.
    pub fn gate(&self) -> GateDecision {
        self.inner.policy.evaluate(self.inner.power.battery())
    }

    // ── Connectivity ─────────────────────────────────────────────────────

    /// Flip the mesh-availability flag.
    ///
    /// Coming up queues every pending file the gate admits. Going down
    /// cancels in-flight transfers; their files keep whatever state they last
    /// recorded and are picked up again on the next connect.
    pub async fn set_mesh_available(&self, available: bool) -> MeshResult<()> {
        let was = self.inner.mesh_available.swap(available, Ordering::SeqCst);
        if was == available {
            return Ok(());
        }

        if available {
            let queued = self.enqueue_pending().await?;
            info!(parent: &self.inner.span, queued, "mesh available");
            self.inner.wake.notify_one();
        } else {
            self.inner.cancel_transfers();
            info!(
                parent: &self.inner.span,
                active = self.active_sync_count(),
                "mesh unavailable, cancelling active transfers"
            );
        }
        Ok(())
    }

    /// Poll `probe` and drive [`set_mesh_available`](SyncQueue::set_mesh_available).
    pub fn spawn_connectivity_monitor(&self, probe: Arc<dyn ConnectivityProbe>) {
        let this = self.clone();
        let every = Duration::from_secs(self.inner.config.connectivity_poll_secs);
        let shutdown = self.inner.shutdown.clone();

        let task = async move {
            loop {
                let reachable = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = probe.is_reachable() => r,
                };
                if let Err(e) = this.set_mesh_available(reachable).await {
                    warn!(error = %e, "applying connectivity change failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            }
            debug!("connectivity monitor stopped");
        };
        self.inner
            .tracker
            .spawn(task.instrument(self.inner.span.clone()));
    }

    // ── Queueing ─────────────────────────────────────────────────────────

    /// Queue `kind` for `file`, superseding anything already queued for its
    /// path. Uploads move the file to STAGING.
    pub async fn enqueue(&self, file: StagedFile, kind: OperationKind) -> MeshResult<SyncHandle> {
        let file = match kind {
            OperationKind::Upload | OperationKind::Update => {
                let mut store = self.inner.store.lock().await;
                match store.get(&file.path).map(|f| f.state) {
                    None => return Err(MeshError::NotFound(file.path)),
                    Some(FileState::MeshOnly) => {
                        return Err(MeshError::InvalidState(format!(
                            "{} has no local copy to upload",
                            file.path
                        )))
                    }
                    Some(_) => {}
                }
                let staged = store
                    .set_state(&file.path, FileState::Staging)
                    .ok_or_else(|| MeshError::NotFound(file.path.clone()))?;
                store.flush().await?;
                staged
            }
            OperationKind::Download | OperationKind::Delete => file,
        };

        debug!(
            parent: &self.inner.span,
            path = %file.path,
            kind = kind.as_str(),
            priority = file.priority.as_str(),
            "operation queued"
        );
        let (op, handle) = SyncOperation::new(file, kind);
        self.inner.queue().push(op);
        self.inner.wake.notify_one();
        Ok(handle)
    }

    fn supersede(&self, path: &str) {
        let removed = self.inner.queue().remove(path);
        if let Some(mut op) = removed {
            op.complete(SyncResult::Superseded);
        }
    }

    /// Queue every LOCAL_ONLY, STAGING or SYNCING file, and every pending
    /// mesh delete, that the gate admits and that has nothing queued yet.
    async fn enqueue_pending(&self) -> MeshResult<usize> {
        let gate = self.gate();
        let (uploads, deletes) = {
            let store = self.inner.store.lock().await;
            (
                store.in_state(&[FileState::LocalOnly, FileState::Staging, FileState::Syncing]),
                store.tombstones(),
            )
        };

        let mut queued = 0;
        let work = uploads
            .into_iter()
            .map(|f| (f, OperationKind::Upload))
            .chain(deletes.into_iter().map(|f| (f, OperationKind::Delete)));
        for (file, kind) in work {
            if !gate.permits(file.priority) || self.inner.queue().contains(&file.path) {
                continue;
            }
            self.enqueue(file, kind).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Forget the pending mesh delete for `path`.
    async fn settle_delete(&self, path: &str) {
        let mut store = self.inner.store.lock().await;
        if store.remove_tombstone(path) {
            if let Err(e) = store.flush().await {
                warn!(path, error = %e, "persisting settled delete failed");
            }
        }
    }

    // ── Worker ───────────────────────────────────────────────────────────

    /// Run one scheduling iteration: check the gate, drain a batch and
    /// execute it in chunks of `max_concurrent`, waiting for each chunk.
    pub async fn process_batch(&self) -> MeshResult<TickOutcome> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(TickOutcome::Skipped(SkipReason::ShuttingDown));
        }
        if !self.is_mesh_available() {
            return Ok(TickOutcome::Skipped(SkipReason::MeshUnavailable));
        }
        let gate = self.gate();
        if gate == GateDecision::Deny {
            return Ok(TickOutcome::Skipped(SkipReason::BatteryDeny));
        }

        if self.pending_sync_count() == 0 {
            let swept = self.enqueue_pending().await?;
            if swept > 0 {
                debug!(parent: &self.inner.span, swept, "queued pending files");
            }
        }

        let batch = self
            .inner
            .queue()
            .drain_batch(self.inner.config.batch_size, gate == GateDecision::CriticalOnly);
        if batch.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let count = batch.len();
        let cancel = self.inner.transfer_token();
        let mut ops = batch.into_iter();
        loop {
            let chunk: Vec<SyncOperation> =
                ops.by_ref().take(self.inner.config.max_concurrent).collect();
            if chunk.is_empty() {
                break;
            }
            let handles: Vec<_> = chunk
                .into_iter()
                .map(|op| {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    self.inner.tracker.spawn(
                        async move { this.execute(op, cancel).await }
                            .instrument(self.inner.span.clone()),
                    )
                })
                .collect();
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(parent: &self.inner.span, error = %e, "sync task panicked");
                }
            }
        }
        Ok(TickOutcome::Processed { count })
    }

    async fn run_worker(self) {
        info!("sync worker started");
        let config = &self.inner.config;
        loop {
            let pause = match self.process_batch().await {
                Ok(TickOutcome::Processed { count }) => {
                    debug!(count, "batch processed");
                    continue;
                }
                Ok(TickOutcome::Idle) => Duration::from_secs(config.idle_backoff_secs),
                Ok(TickOutcome::Skipped(SkipReason::ShuttingDown)) => break,
                Ok(TickOutcome::Skipped(reason)) => {
                    debug!(?reason, "sync skipped");
                    Duration::from_secs(config.gated_backoff_secs)
                }
                Err(e) => {
                    warn!(error = %e, "sync iteration failed");
                    Duration::from_secs(config.error_backoff_secs)
                }
            };
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("sync worker stopped");
    }

    // ── Task execution ───────────────────────────────────────────────────

    async fn execute(&self, mut op: SyncOperation, cancel: CancellationToken) {
        let _active = ActiveGuard::new(&self.inner.active);
        let path = op.path().to_string();

        let outcome = match op.kind {
            OperationKind::Upload | OperationKind::Update => {
                self.upload_once(&path, &cancel).await.map(|u| match u {
                    UploadOutcome::Synced => SyncResult::Completed,
                    UploadOutcome::Restaged => SyncResult::Superseded,
                    UploadOutcome::Vanished => SyncResult::Cancelled,
                })
            }
            OperationKind::Download => self
                .download_once(&op.file, &cancel)
                .await
                .map(|_| SyncResult::Completed),
            OperationKind::Delete => self
                .bounded("delete", &path, &cancel, self.inner.transfer.delete(&path))
                .await
                .map(|_| SyncResult::Completed),
        };

        match outcome {
            Ok(result) => {
                if op.kind == OperationKind::Delete {
                    self.settle_delete(&path).await;
                }
                if result == SyncResult::Completed {
                    info!(path = %path, kind = op.kind.as_str(), "sync completed");
                } else {
                    debug!(path = %path, ?result, "sync operation dropped");
                }
                op.complete(result);
            }
            Err(MeshError::Cancelled) => {
                debug!(path = %path, "sync cancelled");
                op.complete(SyncResult::Cancelled);
            }
            Err(e) => self.handle_failure(op, e, &cancel).await,
        }
    }

    /// One upload attempt: SYNCING, transmit, then SYNCED if the staged bytes
    /// did not change underneath.
    async fn upload_once(&self, path: &str, cancel: &CancellationToken) -> MeshResult<UploadOutcome> {
        let (file, data) = {
            let mut store = self.inner.store.lock().await;
            let Some(file) = store.set_state(path, FileState::Syncing) else {
                return Ok(UploadOutcome::Vanished);
            };
            store.flush().await?;
            let data = store.read_blob(&file.local_path).await?;
            (file, data)
        };

        self.bounded("upload", path, cancel, self.inner.transfer.upload(&file, &data))
            .await?;

        let mut store = self.inner.store.lock().await;
        let mut synced = false;
        let current = store.update(path, |f| {
            if f.checksum == file.checksum {
                f.state = FileState::Synced;
                f.retry_count = 0;
                synced = true;
            }
        });
        store.flush().await?;
        Ok(match current {
            None => UploadOutcome::Vanished,
            Some(_) if synced => UploadOutcome::Synced,
            Some(_) => UploadOutcome::Restaged,
        })
    }

    async fn download_once(&self, file: &StagedFile, cancel: &CancellationToken) -> MeshResult<()> {
        match self.file_state(&file.path).await {
            Some(FileState::MeshOnly) => {}
            // already fetched, or removed meanwhile
            _ => return Ok(()),
        }
        let data = self.fetch_from_mesh(file, cancel).await?;
        self.cache_mesh_copy(&file.path, &data, file.priority).await?;
        Ok(())
    }

    async fn fetch_from_mesh(&self, file: &StagedFile, cancel: &CancellationToken) -> MeshResult<Vec<u8>> {
        let data = self
            .bounded("download", &file.path, cancel, self.inner.transfer.download(&file.path))
            .await?
            .ok_or_else(|| MeshError::NotFound(file.path.clone()))?;
        if !file.checksum.is_empty() && !verify(&data, &file.checksum) {
            return Err(MeshError::Decode(format!(
                "mesh copy of {} does not match checksum {}",
                file.path, file.checksum
            )));
        }
        Ok(data)
    }

    async fn handle_failure(&self, mut op: SyncOperation, error: MeshError, cancel: &CancellationToken) {
        op.attempts += 1;
        let attempts = op.attempts;
        let path = op.path().to_string();
        let retry = error.is_retryable() && attempts < self.inner.config.max_retries;

        if matches!(op.kind, OperationKind::Upload | OperationKind::Update) {
            let snapshot = {
                let mut store = self.inner.store.lock().await;
                let updated = store.update(&path, |f| {
                    f.retry_count = attempts;
                    f.state = if retry {
                        FileState::Staging
                    } else {
                        FileState::SyncFailed
                    };
                });
                if let Err(e) = store.flush().await {
                    warn!(error = %e, "persisting staged-file state failed");
                }
                updated
            };
            match snapshot {
                Some(file) => op.file = file,
                None => {
                    op.complete(SyncResult::Cancelled);
                    return;
                }
            }
        }

        if !retry {
            warn!(path = %path, attempts, error = %error, "sync failed permanently");
            if op.kind == OperationKind::Delete {
                self.settle_delete(&path).await;
            }
            op.complete(SyncResult::Failed {
                error: error.to_string(),
            });
            return;
        }

        let delay = self.inner.config.retry_delay(attempts);
        warn!(
            path = %path,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "sync failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                op.complete(SyncResult::Cancelled);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        self.requeue(op);
    }

    /// Put a retried operation back unless a newer one arrived meanwhile.
    fn requeue(&self, mut op: SyncOperation) {
        let mut queue = self.inner.queue();
        if queue.contains(op.path()) {
            op.complete(SyncResult::Superseded);
        } else {
            queue.push(op);
        }
    }

    /// Bound a mesh call by the transfer timeout and `cancel`.
    async fn bounded<T>(
        &self,
        what: &str,
        path: &str,
        cancel: &CancellationToken,
        fut: impl Future<Output = MeshResult<T>>,
    ) -> MeshResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            res = tokio::time::timeout(self.inner.config.transfer_timeout(), fut) => match res {
                Ok(r) => r,
                Err(_) => Err(MeshError::Timeout(format!("{what} of {path}"))),
            },
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Cancel the supervising scope, wait for every task, then persist state.
    /// Still-queued operations resolve as cancelled.
    pub async fn shutdown(&self) -> MeshResult<()> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let cancelled = self.inner.queue().clear_with(SyncResult::Cancelled);
        self.inner.store.lock().await.flush().await?;
        info!(parent: &self.inner.span, cancelled, "sync queue stopped");
        Ok(())
    }
}
