//! Daemon lifecycle: identity, key material, component wiring, shutdown

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mesh_core::config::MeshConfig;
use mesh_core::DeviceProfile;
use mesh_crypto::{KdfParams, StorageKey, XChaChaEncryptor, SALT_LEN};
use mesh_storage::DistributedStorageManager;
use mesh_sync::SyncQueue;
use rand::RngCore;
use secrecy::SecretString;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, info_span, warn};

use crate::offline::OfflineMesh;

/// Passphrase for the Argon2id key hierarchy; unset means a random key file.
const PASSPHRASE_ENV: &str = "MESHSTAGE_PASSPHRASE";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config: MeshConfig) -> Result<()> {
    let data_dir = config.daemon.data_dir.clone();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data dir: {}", data_dir.display()))?;

    // ── Identity and keys ────────────────────────────────────────────────
    let node_id = resolve_node_id(config.daemon.node_id.clone(), &data_dir).await?;
    let key = load_storage_key(&config, &data_dir).await?;
    info!(node = %node_id, data_dir = %data_dir.display(), "node identity ready");

    // ── Components ───────────────────────────────────────────────────────
    let op = mesh_sync::local::build_operator(&data_dir)?;
    let mesh = Arc::new(OfflineMesh::new(
        node_id.clone(),
        config.gossip.clone(),
        info_span!("gossip", node = %node_id),
    ));

    // mains-powered until a platform layer supplies battery readings
    let power = Arc::new(DeviceProfile::default());
    let sync = SyncQueue::open(
        op.clone(),
        mesh.clone(),
        power,
        config.sync.clone(),
        config.battery.clone(),
        info_span!("sync", node = %node_id),
    )
    .await?;

    let storage = DistributedStorageManager::open(
        node_id.clone(),
        op,
        sync.clone(),
        mesh.clone(),
        Arc::new(XChaChaEncryptor::new(key)),
        config.storage.clone(),
        info_span!("storage", node = %node_id),
    )
    .await?;

    sync.start();
    sync.spawn_connectivity_monitor(mesh.clone());
    storage.start();
    if config.storage.participation_enabled {
        storage
            .configure_storage_participation(config.storage.participation())
            .await?;
    }

    let heartbeat = tokio::spawn({
        let mesh = mesh.clone();
        async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = mesh.heartbeat() {
                    warn!(error = %e, "heartbeat encoding failed");
                }
            }
        }
    });

    let quota = storage.quota_info();
    info!(
        files = storage.list_files().len(),
        used = quota.used_quota,
        total = quota.total_quota,
        participating = config.storage.participation_enabled,
        "daemon ready"
    );

    // ── Run until signalled ──────────────────────────────────────────────
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    heartbeat.abort();
    storage.shutdown().await?;
    info!(known_nodes = mesh.known_nodes(), "daemon stopped");
    Ok(())
}

/// Configured node id, else the one persisted under `data_dir`, else a fresh one.
async fn resolve_node_id(configured: Option<String>, data_dir: &Path) -> Result<String> {
    if let Some(id) = configured {
        return Ok(id);
    }
    let path = data_dir.join("node_id");
    match tokio::fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => warn!(path = %path.display(), "empty node id file, generating a new id"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("reading node id: {}", path.display()));
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    tokio::fs::write(&path, &id)
        .await
        .with_context(|| format!("writing node id: {}", path.display()))?;
    info!(node = %id, "generated node id");
    Ok(id)
}

/// Passphrase-derived key when `MESHSTAGE_PASSPHRASE` is set, else the
/// random key persisted in the configured key file.
async fn load_storage_key(config: &MeshConfig, data_dir: &Path) -> Result<StorageKey> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        let salt = load_or_create_salt(&data_dir.join("key.salt")).await?;
        let params = KdfParams::from(&config.crypto);
        let passphrase = SecretString::from(passphrase);
        let key = tokio::task::spawn_blocking(move || -> Result<StorageKey> {
            let master = mesh_crypto::derive_master_key(&passphrase, &salt, &params)?;
            Ok(mesh_crypto::derive_storage_key(&master)?)
        })
        .await
        .context("key derivation task")??;
        info!("storage key derived from passphrase");
        return Ok(key);
    }

    let key_file: PathBuf = config
        .crypto
        .key_file
        .clone()
        .unwrap_or_else(|| data_dir.join("storage.key"));
    mesh_crypto::load_or_create_key(&key_file)
}

async fn load_or_create_salt(path: &Path) -> Result<[u8; SALT_LEN]> {
    match tokio::fs::read(path).await {
        Ok(bytes) => bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("salt file {} is not {SALT_LEN} bytes", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            tokio::fs::write(path, salt)
                .await
                .with_context(|| format!("writing salt: {}", path.display()))?;
            Ok(salt)
        }
        Err(e) => Err(e).with_context(|| format!("reading salt: {}", path.display())),
    }
}
