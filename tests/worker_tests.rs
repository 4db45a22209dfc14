//! Integration tests for the worker layer: coordinator sync, under-store
//! fallback reads, cache population, and session reaping.

use std::sync::Arc;
use std::time::Duration;

use blockworker::config::{Config, DirSpec, TierSpec, TiersConfig};
use blockworker::error::StoreError;
use blockworker::store::location::{BlockLocation, Medium};
use blockworker::store::store::TieredBlockStore;
use blockworker::ufs::bridge::{UfsBlockOptions, UnderStoreBlockBridge};
use blockworker::ufs::client::LocalUnderStore;
use blockworker::worker::cache_manager::CacheRequest;
use blockworker::worker::coordinator::{StandaloneCoordinator, WorkerCommand};
use blockworker::worker::reaper::SessionReaper;
use blockworker::worker::BlockWorker;
use tempfile::TempDir;

fn test_config(root: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.tiers = TiersConfig {
        tiers: vec![TierSpec {
            alias: "MEM".to_string(),
            medium: Medium::Mem,
            dirs: vec![DirSpec {
                path: root.join("mem"),
                capacity_bytes: 1 << 20,
            }],
        }],
    };
    cfg.ufs.root = root.join("ufs");
    cfg.heartbeat.interval_ms = 20;
    cfg.heartbeat.retry_timeout_ms = 0;
    cfg.heartbeat.backoff_base_ms = 1;
    cfg.heartbeat.backoff_max_ms = 2;
    cfg.heartbeat.registration_timeout_ms = 500;
    cfg
}

async fn worker_fixture() -> (TempDir, BlockWorker, Arc<StandaloneCoordinator>) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    tokio::fs::create_dir_all(&cfg.ufs.root).await.unwrap();
    let coordinator = Arc::new(StandaloneCoordinator::new());
    let ufs = Arc::new(LocalUnderStore::new(cfg.ufs.root.clone()));
    let worker = BlockWorker::new(cfg, coordinator.clone(), ufs)
        .await
        .unwrap();
    (tmp, worker, coordinator)
}

async fn commit_filled(worker: &BlockWorker, session_id: u64, block_id: u64, data: &[u8]) {
    worker
        .create_block(session_id, block_id, data.len() as u64, BlockLocation::AnyTier)
        .await
        .unwrap();
    let mut writer = worker
        .create_block_writer(session_id, block_id)
        .await
        .unwrap();
    writer.append(data).await.unwrap();
    writer.flush().await.unwrap();
    drop(writer);
    worker.commit_block(session_id, block_id, false).await.unwrap();
}

#[tokio::test]
async fn test_commit_is_synchronously_visible_to_coordinator() {
    let (_tmp, worker, coordinator) = worker_fixture().await;
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();
    assert_eq!(worker.worker_id(), 1);

    commit_filled(&worker, 1, 10, b"payload").await;
    assert!(coordinator.known_blocks().contains(&10));
}

#[tokio::test]
async fn test_heartbeat_reports_removals() {
    let (_tmp, worker, coordinator) = worker_fixture().await;
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();

    commit_filled(&worker, 1, 10, b"payload").await;
    worker.remove_block(1, 10).await.unwrap();

    // The removal rides the next heartbeat delta.
    assert!(coordinator.known_blocks().contains(&10));
    sync.beat_once().await;
    assert!(!coordinator.known_blocks().contains(&10));
}

#[tokio::test]
async fn test_failed_heartbeat_merges_delta_back() {
    let (_tmp, worker, coordinator) = worker_fixture().await;
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();

    commit_filled(&worker, 1, 10, b"payload").await;
    worker.remove_block(1, 10).await.unwrap();

    coordinator.fail_next_heartbeats(1);
    sync.beat_once().await;
    // The delta was not lost; the next cycle delivers it.
    assert!(coordinator.known_blocks().contains(&10));
    sync.beat_once().await;
    assert!(!coordinator.known_blocks().contains(&10));
}

#[tokio::test]
async fn test_retried_heartbeat_carries_changes_made_during_outage() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.heartbeat.retry_timeout_ms = 1_000;
    cfg.heartbeat.backoff_base_ms = 100;
    cfg.heartbeat.backoff_max_ms = 100;
    tokio::fs::create_dir_all(&cfg.ufs.root).await.unwrap();
    let coordinator = Arc::new(StandaloneCoordinator::new());
    let ufs = Arc::new(LocalUnderStore::new(cfg.ufs.root.clone()));
    let worker = BlockWorker::new(cfg, coordinator.clone(), ufs)
        .await
        .unwrap();
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();

    commit_filled(&worker, 1, 10, b"aaaa").await;
    commit_filled(&worker, 1, 11, b"bbbb").await;
    worker.remove_block(1, 10).await.unwrap();

    coordinator.fail_next_heartbeats(1);
    let beat = tokio::spawn(async move { sync.beat_once().await });
    // Let the first attempt fail and the cycle enter its backoff sleep,
    // then record another removal mid-outage.
    tokio::time::sleep(Duration::from_millis(30)).await;
    worker.remove_block(1, 11).await.unwrap();
    beat.await.unwrap();

    // The retried send delivered both removals in one cycle.
    let known = coordinator.known_blocks();
    assert!(!known.contains(&10));
    assert!(!known.contains(&11));
}

#[tokio::test]
async fn test_disowned_worker_reregisters_with_full_inventory() {
    let (_tmp, worker, coordinator) = worker_fixture().await;
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();

    commit_filled(&worker, 1, 10, b"aaaa").await;
    commit_filled(&worker, 1, 11, b"bbbb").await;
    sync.beat_once().await;

    coordinator.disown_worker();
    sync.beat_once().await;

    assert_eq!(coordinator.registrations(), 2);
    let known = coordinator.known_blocks();
    assert!(known.contains(&10) && known.contains(&11));
}

#[tokio::test]
async fn test_free_block_command_is_executed() {
    let (_tmp, worker, coordinator) = worker_fixture().await;
    let sync = worker.heartbeat_sync();
    sync.acquire_worker_id().await.unwrap();

    commit_filled(&worker, 1, 10, b"payload").await;
    coordinator.queue_command(WorkerCommand::FreeBlock(10));
    sync.beat_once().await;

    assert!(worker.store().lookup(10).await.is_none());
}

#[tokio::test]
async fn test_ufs_fallback_read_caches_block() {
    let (tmp, worker, _coordinator) = worker_fixture().await;
    let data = vec![42u8; 64];
    tokio::fs::write(tmp.path().join("ufs/data.bin"), &data)
        .await
        .unwrap();

    // Local miss first.
    assert!(matches!(
        worker.create_block_reader(5, 9, 0).await,
        Err(StoreError::BlockNotFound(9))
    ));

    worker
        .open_ufs_block(
            5,
            9,
            UfsBlockOptions {
                ufs_path: "data.bin".to_string(),
                offset_in_file: 0,
                block_size: 64,
                cache_on_read: true,
            },
        )
        .unwrap();
    let mut reader = worker.create_ufs_reader(5, 9, 0).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, data);
    reader.close().await;
    assert!(worker.close_ufs_block(5, 9));

    // The full sequential read populated the local store.
    let mut local = worker.create_block_reader(5, 9, 0).await.unwrap();
    let mut cached = Vec::new();
    local.read_to_end(&mut cached).await.unwrap();
    assert_eq!(cached, data);
}

#[tokio::test]
async fn test_read_block_falls_back_then_serves_locally() {
    let (tmp, worker, _coordinator) = worker_fixture().await;
    let data = vec![9u8; 32];
    tokio::fs::write(tmp.path().join("ufs/blob.bin"), &data)
        .await
        .unwrap();
    let opts = UfsBlockOptions {
        ufs_path: "blob.bin".to_string(),
        offset_in_file: 0,
        block_size: 32,
        cache_on_read: true,
    };

    // A miss with no fallback stays a miss.
    assert!(matches!(
        worker.read_block(5, 77, 0, None).await,
        Err(StoreError::BlockNotFound(77))
    ));

    let mut reader = worker.read_block(5, 77, 0, Some(opts)).await.unwrap();
    assert!(!reader.is_local());
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, data);
    worker.close_reader(reader).await;

    // The fallback read populated the local store.
    let mut local = worker.read_block(5, 77, 0, None).await.unwrap();
    assert!(local.is_local());
    let mut cached = Vec::new();
    local.read_to_end(&mut cached).await.unwrap();
    assert_eq!(cached, data);
    worker.close_reader(local).await;
}

#[tokio::test]
async fn test_cache_request_dedup() {
    let (tmp, worker, _coordinator) = worker_fixture().await;
    tokio::fs::write(tmp.path().join("ufs/data.bin"), vec![7u8; 128])
        .await
        .unwrap();

    let request = CacheRequest {
        block_id: 20,
        ufs_path: "data.bin".to_string(),
        offset_in_file: 0,
        block_size: 128,
        hint: BlockLocation::AnyTier,
    };
    worker.cache_block(request.clone()).await.unwrap();
    assert!(matches!(
        worker.cache_block(request).await,
        Err(StoreError::BlockAlreadyExists(20))
    ));

    let mut reader = worker.create_block_reader(1, 20, 0).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, vec![7u8; 128]);
}

#[tokio::test]
async fn test_load_populates_batch() {
    let (tmp, worker, _coordinator) = worker_fixture().await;
    let mut file = Vec::new();
    file.extend_from_slice(&[1u8; 128]);
    file.extend_from_slice(&[2u8; 128]);
    tokio::fs::write(tmp.path().join("ufs/big.bin"), &file)
        .await
        .unwrap();

    let requests = vec![
        CacheRequest {
            block_id: 30,
            ufs_path: "big.bin".to_string(),
            offset_in_file: 0,
            block_size: 128,
            hint: BlockLocation::AnyTier,
        },
        CacheRequest {
            block_id: 31,
            ufs_path: "big.bin".to_string(),
            offset_in_file: 128,
            block_size: 128,
            hint: BlockLocation::AnyTier,
        },
    ];
    let failures = worker.load(requests).await;
    assert!(failures.is_empty());

    let mut reader = worker.create_block_reader(1, 31, 0).await.unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, vec![2u8; 128]);
}

#[tokio::test]
async fn test_load_reports_missing_source() {
    let (_tmp, worker, _coordinator) = worker_fixture().await;
    let failures = worker
        .load(vec![CacheRequest {
            block_id: 40,
            ufs_path: "absent.bin".to_string(),
            offset_in_file: 0,
            block_size: 64,
            hint: BlockLocation::AnyTier,
        }])
        .await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 40);
    assert!(matches!(failures[0].1, StoreError::Unavailable(_)));
    // The failed populate left nothing behind.
    assert!(worker.store().lookup(40).await.is_none());
}

#[tokio::test]
async fn test_reaper_tears_down_idle_sessions() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.session.timeout_ms = 0;
    let store = TieredBlockStore::open(&cfg).await.unwrap();
    let bridge = Arc::new(UnderStoreBlockBridge::new(
        Arc::new(LocalUnderStore::new(cfg.ufs.root.clone())),
        store.clone(),
    ));

    store
        .create_block(42, 1, 16, BlockLocation::AnyTier)
        .await
        .unwrap();
    bridge
        .open_block(
            42,
            5,
            UfsBlockOptions {
                ufs_path: "f.bin".to_string(),
                offset_in_file: 0,
                block_size: 16,
                cache_on_read: false,
            },
        )
        .unwrap();

    let reaper = SessionReaper::new(store.clone(), bridge.clone(), cfg.session.clone());
    reaper.sweep_once().await;

    assert!(store.lookup(1).await.is_none());
    assert_eq!(bridge.reader_count(5), 0);
    assert_eq!(store.sessions().count(), 0);
}
