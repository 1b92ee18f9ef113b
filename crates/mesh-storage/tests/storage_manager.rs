//! Integration tests: distributed storage manager over a fake mesh.

mod common;

use common::{node, node_on, storage_config};
use mesh_core::{
    unix_millis, AccessPattern, MeshError, ParticipationConfig, ReplicationLevel, StorageFeature,
    StorageOperation, SyncPriority,
};
use mesh_crypto::{Encryptor, XChaChaEncryptor};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

// ── Quota ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn over_quota_store_has_no_side_effects() {
    let n = node(100, false).await;
    n.manager
        .store_file("a", &[1; 60], SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();

    let err = n
        .manager
        .store_file("b", &[2; 50], SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MeshError::QuotaExceeded {
            requested: 50,
            available: 40
        }
    ));
    assert_eq!(n.manager.list_files().len(), 1);
    assert_eq!(n.manager.quota_info().used_quota, 60);
    assert!(n.manager.sync_queue().staged_file("b").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_writes_to_one_path_charge_it_once() {
    let n = node(1 << 20, false).await;
    for round in 0u8..10 {
        let writers: Vec<_> = (0..2u8)
            .map(|w| {
                let manager = n.manager.clone();
                tokio::spawn(async move {
                    manager
                        .store_file("shared", &[round ^ w; 100], SyncPriority::Normal, ReplicationLevel::Minimal)
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(n.manager.quota_info().used_quota, 100, "round {round}");
    }

    assert!(n.manager.delete_file("shared").await.unwrap());
    assert_eq!(n.manager.quota_info().used_quota, 0);
}

#[tokio::test]
async fn replacing_a_file_charges_the_difference() {
    let n = node(100, false).await;
    n.manager
        .store_file("a", &[1; 80], SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();
    n.manager
        .store_file("a", &[1; 100], SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();

    assert_eq!(n.manager.quota_info().used_quota, 100);
    assert_eq!(n.manager.list_files().len(), 1);
}

// ── Store / retrieve ─────────────────────────────────────────────────────

#[tokio::test]
async fn store_reports_original_size_and_seals_locally() {
    let n = node(1 << 20, false).await;
    let data = b"plaintext that must not hit the disk".to_vec();

    let file = n
        .manager
        .store_file("notes/a", &data, SyncPriority::High, ReplicationLevel::Standard)
        .await
        .unwrap();

    assert_eq!(file.size, data.len() as u64);
    let staged = n.manager.sync_queue().staged_file("notes/a").await.unwrap();
    assert_eq!(
        staged.size,
        (data.len() + XChaChaEncryptor::overhead()) as u64
    );
    let raw = n.manager.sync_queue().read_file("notes/a").await.unwrap();
    assert_ne!(raw, data);

    assert_eq!(n.manager.retrieve_file("notes/a").await.unwrap(), data);
}

#[tokio::test]
async fn local_hit_updates_last_access() {
    let n = node(1 << 20, false).await;
    n.manager
        .store_file("a", b"x", SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();
    let before = n.manager.file_info("a").unwrap().last_access;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    n.manager.retrieve_file("a").await.unwrap();

    assert!(n.manager.file_info("a").unwrap().last_access > before);
}

#[tokio::test]
async fn last_access_survives_an_unclean_restart() {
    let dir = tempfile::tempdir().unwrap();
    let touched = {
        let op = mesh_sync::local::build_operator(dir.path()).unwrap();
        let n = node_on(op, storage_config(1 << 20, false)).await;
        n.manager
            .store_file("log", b"entry", SyncPriority::Normal, ReplicationLevel::Minimal)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        n.manager.retrieve_file("log").await.unwrap();
        let info = n.manager.file_info("log").unwrap();
        assert!(info.last_access > info.created_at);
        // dropped without shutdown, as after a crash
        info.last_access
    };

    let op = mesh_sync::local::build_operator(dir.path()).unwrap();
    let n = node_on(op, storage_config(1 << 20, false)).await;
    assert_eq!(n.manager.file_info("log").unwrap().last_access, touched);
}

#[tokio::test]
async fn local_miss_without_participation_is_not_found() {
    let n = node(1 << 20, false).await;
    n.mesh.hold("peer", "remote", n.encryptor.encrypt(b"r").unwrap());
    assert!(matches!(
        n.manager.retrieve_file("remote").await,
        Err(MeshError::NotFound(_))
    ));
}

#[tokio::test]
async fn mesh_retrieval_skips_undecryptable_candidates() {
    let n = node(1 << 20, true).await;
    n.mesh.hold("bad", "remote/doc", b"not a sealed blob at all, just bytes".to_vec());
    n.mesh.hold("good", "remote/doc", n.encryptor.encrypt(b"the real thing").unwrap());

    let data = n.manager.retrieve_file("remote/doc").await.unwrap();

    assert_eq!(data, b"the real thing");
}

#[tokio::test]
async fn mesh_retrieval_exhausting_candidates_is_not_found() {
    let n = node(1 << 20, true).await;
    let foreign = XChaChaEncryptor::new(mesh_crypto::generate_storage_key());
    n.mesh.hold("a", "remote/doc", foreign.encrypt(b"other key").unwrap());
    n.mesh.hold("b", "remote/doc", vec![0; 3]);

    assert!(matches!(
        n.manager.retrieve_file("remote/doc").await,
        Err(MeshError::NotFound(_))
    ));
}

// ── Replication ──────────────────────────────────────────────────────────

#[tokio::test]
async fn standard_replication_with_two_nodes_is_partial() {
    let n = node(1 << 20, true).await;
    n.mesh.set_nodes(&["n1", "n2"]);

    n.manager
        .store_file("f", b"data", SyncPriority::Normal, ReplicationLevel::Standard)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;

    let sent = n.mesh.requests_of(StorageOperation::Replicate);
    assert_eq!(
        sent,
        vec![("n1".to_string(), "f".to_string()), ("n2".to_string(), "f".to_string())]
    );
    assert_eq!(n.manager.replication_health("f"), Some(1.0));
    assert_eq!(n.manager.file_info("f").unwrap().replica_nodes, vec!["n1", "n2"]);
}

#[tokio::test]
async fn minimal_replication_with_five_nodes_picks_one() {
    let n = node(1 << 20, true).await;
    n.mesh.set_nodes(&["n1", "n2", "n3", "n4", "n5"]);

    n.manager
        .store_file("f", b"data", SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;

    assert_eq!(
        n.mesh.requests_of(StorageOperation::Replicate),
        vec![("n1".to_string(), "f".to_string())]
    );
}

#[tokio::test]
async fn unanswered_requests_lower_health() {
    let n = node(1 << 20, true).await;
    n.mesh.set_nodes(&["a", "b", "c"]);
    n.mesh.fail_node("b");

    n.manager
        .store_file("f", b"data", SyncPriority::Normal, ReplicationLevel::Standard)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;

    let health = n.manager.replication_health("f").unwrap();
    assert!((health - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(n.manager.file_info("f").unwrap().replica_nodes, vec!["a", "c"]);
}

#[tokio::test]
async fn no_distribution_without_participation() {
    let n = node(1 << 20, false).await;
    n.mesh.set_nodes(&["a"]);
    n.manager
        .store_file("f", b"data", SyncPriority::Normal, ReplicationLevel::Standard)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;

    assert!(n.mesh.requests.lock().unwrap().is_empty());
    assert_eq!(n.manager.replication_health("f"), None);
}

#[tokio::test]
async fn external_confirmation_updates_health() {
    let n = node(1 << 20, true).await;
    n.mesh.set_nodes(&["a", "b"]);
    n.mesh.fail_node("b");
    n.manager
        .store_file("f", b"data", SyncPriority::Normal, ReplicationLevel::Standard)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;
    assert_eq!(n.manager.replication_health("f"), Some(0.5));

    assert!(n.manager.confirm_replica("f", "b"));
    assert_eq!(n.manager.replication_health("f"), Some(1.0));
    assert!(n.manager.revoke_replica("f", "a"));
    assert_eq!(n.manager.file_info("f").unwrap().replica_nodes, vec!["b"]);
}

// ── Delete ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_notifies_replica_holders_and_frees_quota() {
    let n = node(1 << 20, true).await;
    n.mesh.set_nodes(&["n1", "n2"]);
    n.manager
        .store_file("f", &[9; 10], SyncPriority::Normal, ReplicationLevel::Standard)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;

    assert!(n.manager.delete_file("f").await.unwrap());
    n.manager.wait_for_replication().await;

    assert_eq!(n.mesh.requests_of(StorageOperation::Delete).len(), 2);
    assert!(n.manager.file_info("f").is_none());
    assert_eq!(n.manager.replication_health("f"), None);
    assert_eq!(n.manager.quota_info().used_quota, 0);
    assert!(n.manager.sync_queue().staged_file("f").await.is_none());
}

#[tokio::test]
async fn deleting_unknown_path_is_not_an_error() {
    let n = node(1 << 20, true).await;
    assert!(!n.manager.delete_file("ghost").await.unwrap());
}

// ── Participation and capabilities ───────────────────────────────────────

#[tokio::test]
async fn enabling_participation_broadcasts_once() {
    let n = node(1 << 20, false).await;
    let mut config = ParticipationConfig {
        enabled: true,
        quota_bytes: 2 << 20,
        default_replication: ReplicationLevel::High,
    };

    n.manager.configure_storage_participation(config.clone()).await.unwrap();
    assert_eq!(n.mesh.advert_count(), 1);
    assert_eq!(n.manager.quota_info().total_quota, 2 << 20);
    let advert = n.mesh.adverts.lock().unwrap()[0].clone();
    assert!(advert.participation_enabled);
    assert_eq!(advert.replication_factor, 5);

    // already on: no new broadcast
    n.manager.configure_storage_participation(config.clone()).await.unwrap();
    assert_eq!(n.mesh.advert_count(), 1);

    config.enabled = false;
    n.manager.configure_storage_participation(config).await.unwrap();
    assert_eq!(n.mesh.advert_count(), 1);
    assert!(!n.manager.get_storage_capabilities().participation_enabled);
}

#[tokio::test]
async fn zero_quota_participation_is_rejected() {
    let n = node(1 << 20, false).await;
    let err = n
        .manager
        .configure_storage_participation(ParticipationConfig {
            enabled: true,
            quota_bytes: 0,
            default_replication: ReplicationLevel::Minimal,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Config(_)));
    assert_eq!(n.mesh.advert_count(), 0);
}

#[tokio::test]
async fn capabilities_reflect_contents_and_policy() {
    let n = node(1_000, true).await;
    n.manager
        .store_file("hot", &[0; 100], SyncPriority::High, ReplicationLevel::Minimal)
        .await
        .unwrap();

    let caps = n.manager.get_storage_capabilities();

    assert_eq!(caps.node_id, "self");
    assert_eq!(caps.offered_bytes, 1_000);
    assert_eq!(caps.used_bytes, 100);
    assert_eq!(caps.file_count, 1);
    assert!(caps.features.contains(&StorageFeature::Encryption));
    assert!(caps.features.contains(&StorageFeature::Replication));
    assert!(caps.access_patterns.contains(&AccessPattern::LowLatency));
    assert!(caps.access_patterns.contains(&AccessPattern::ReplicaHost));
    assert!(!caps.access_patterns.contains(&AccessPattern::Archival));
    // pure read
    assert_eq!(n.mesh.advert_count(), 0);
}

// ── Maintenance ──────────────────────────────────────────────────────────

#[tokio::test]
async fn maintenance_expires_by_priority_retention() {
    let n = node(1 << 20, false).await;
    for (path, priority) in [
        ("critical", SyncPriority::Critical),
        ("high", SyncPriority::High),
        ("normal", SyncPriority::Normal),
        ("low", SyncPriority::Low),
    ] {
        n.manager
            .store_file(path, b"x", priority, ReplicationLevel::Minimal)
            .await
            .unwrap();
    }

    let report = n
        .manager
        .run_maintenance_at(unix_millis() + 2 * DAY_MS)
        .await
        .unwrap();
    assert_eq!(report.expired, vec!["low"]);

    let report = n
        .manager
        .run_maintenance_at(unix_millis() + 8 * DAY_MS)
        .await
        .unwrap();
    assert_eq!(report.expired, vec!["normal"]);

    let report = n
        .manager
        .run_maintenance_at(unix_millis() + 1_000 * DAY_MS)
        .await
        .unwrap();
    assert_eq!(report.expired, vec!["high"]);
    assert_eq!(report.stats.file_count, 1);
    assert!(n.manager.file_info("critical").is_some());
    assert_eq!(n.manager.stats().file_count, 1);
}

#[tokio::test]
async fn maintenance_redistributes_unhealthy_files() {
    let n = node(1 << 20, true).await;
    n.manager
        .store_file("lonely", b"x", SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;
    assert_eq!(n.manager.replication_health("lonely"), Some(0.0));

    n.mesh.set_nodes(&["late-joiner"]);
    let report = n.manager.run_maintenance_at(unix_millis()).await.unwrap();
    n.manager.wait_for_replication().await;

    assert_eq!(report.redistributed, vec!["lonely"]);
    assert_eq!(n.manager.replication_health("lonely"), Some(1.0));
    assert_eq!(n.manager.run_maintenance_at(unix_millis()).await.unwrap().stats.replication_health, 1.0);
}

#[tokio::test]
async fn maintenance_skips_paths_still_distributing() {
    let n = node(1 << 20, true).await;
    n.manager
        .store_file("slow", b"x", SyncPriority::Normal, ReplicationLevel::Minimal)
        .await
        .unwrap();
    n.manager.wait_for_replication().await;
    assert_eq!(n.manager.replication_health("slow"), Some(0.0));

    n.mesh.set_nodes(&["peer"]);
    n.mesh.pause();
    let first = n.manager.run_maintenance_at(unix_millis()).await.unwrap();
    let second = n.manager.run_maintenance_at(unix_millis()).await.unwrap();
    assert_eq!(first.redistributed, vec!["slow"]);
    assert!(second.redistributed.is_empty());

    n.mesh.resume();
    n.manager.wait_for_replication().await;
    assert_eq!(
        n.mesh.requests_of(StorageOperation::Replicate),
        vec![("peer".to_string(), "slow".to_string())]
    );
    assert_eq!(n.manager.replication_health("slow"), Some(1.0));

    // once the job is done the path is eligible again
    n.manager.revoke_replica("slow", "peer");
    let third = n.manager.run_maintenance_at(unix_millis()).await.unwrap();
    assert_eq!(third.redistributed, vec!["slow"]);
    n.manager.wait_for_replication().await;
}

// ── Restart and shutdown ─────────────────────────────────────────────────

#[tokio::test]
async fn metadata_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let op = mesh_sync::local::build_operator(dir.path()).unwrap();
        let n = node_on(op, storage_config(1 << 20, false)).await;
        n.manager
            .store_file("keep", b"persisted", SyncPriority::High, ReplicationLevel::High)
            .await
            .unwrap();
        n.manager.start();
        n.manager.shutdown().await.unwrap();
    }

    let op = mesh_sync::local::build_operator(dir.path()).unwrap();
    let n = node_on(op, storage_config(1 << 20, false)).await;

    let info = n.manager.file_info("keep").unwrap();
    assert_eq!(info.replication, ReplicationLevel::High);
    assert_eq!(n.manager.quota_info().used_quota, 9);
    assert_eq!(n.manager.retrieve_file("keep").await.unwrap(), b"persisted");
}
