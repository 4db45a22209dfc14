//! Integration tests for read-lock protection: in-flight reads block
//! removal and eviction, and lock lifetimes track reader lifetimes.

use blockworker::config::{Config, DirSpec, TierSpec, TiersConfig};
use blockworker::error::StoreError;
use blockworker::store::location::{BlockLocation, Medium};
use blockworker::store::store::TieredBlockStore;
use tempfile::TempDir;

async fn mem_store(capacity: u64) -> (TempDir, TieredBlockStore) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.tiers = TiersConfig {
        tiers: vec![TierSpec {
            alias: "MEM".to_string(),
            medium: Medium::Mem,
            dirs: vec![DirSpec {
                path: tmp.path().join("mem"),
                capacity_bytes: capacity,
            }],
        }],
    };
    let store = TieredBlockStore::open(&cfg).await.unwrap();
    (tmp, store)
}

async fn commit_block(store: &TieredBlockStore, block_id: u64) {
    store
        .create_block(1, block_id, 16, BlockLocation::AnyTier)
        .await
        .unwrap();
    let mut writer = store.create_block_writer(1, block_id).await.unwrap();
    writer.append(b"0123456789abcdef").await.unwrap();
    writer.flush().await.unwrap();
    drop(writer);
    store.commit_block(1, block_id, false).await.unwrap();
}

#[tokio::test]
async fn test_remove_fails_while_read_in_flight() {
    let (_tmp, store) = mem_store(4096).await;
    commit_block(&store, 100).await;

    let mut reader = store.create_block_reader(2, 100, 0).await.unwrap();
    assert!(matches!(
        store.remove_block(3, 100).await,
        Err(StoreError::BlockInUse(100))
    ));

    // The reader still sees the complete data.
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"0123456789abcdef");
    reader.close();

    store.remove_block(3, 100).await.unwrap();
}

#[tokio::test]
async fn test_reader_drop_releases_lock() {
    let (_tmp, store) = mem_store(4096).await;
    commit_block(&store, 100).await;

    let reader = store.create_block_reader(2, 100, 0).await.unwrap();
    assert!(store.locks().is_locked(100));
    drop(reader);
    assert!(!store.locks().is_locked(100));
}

#[tokio::test]
async fn test_concurrent_readers_share_the_block() {
    let (_tmp, store) = mem_store(4096).await;
    commit_block(&store, 100).await;

    let mut a = store.create_block_reader(2, 100, 0).await.unwrap();
    let mut b = store.create_block_reader(3, 100, 0).await.unwrap();
    assert_eq!(store.locks().lock_state(100), (2, false));

    let mut buf_a = Vec::new();
    let mut buf_b = Vec::new();
    a.read_to_end(&mut buf_a).await.unwrap();
    b.read_to_end(&mut buf_b).await.unwrap();
    assert_eq!(buf_a, buf_b);
}

#[tokio::test]
async fn test_session_cleanup_releases_reader_locks() {
    let (_tmp, store) = mem_store(4096).await;
    commit_block(&store, 100).await;

    let reader = store.create_block_reader(7, 100, 0).await.unwrap();
    assert!(store.locks().is_locked(100));

    store.cleanup_session(7).await;
    assert!(!store.locks().is_locked(100));

    // The orphaned guard's release is a benign no-op.
    drop(reader);
    assert!(!store.locks().is_locked(100));
}
