//! The block worker: composes the tiered store, the under-store bridge, the
//! cache-population pool and the coordinator sync into one node.

pub mod cache_manager;
pub mod coordinator;
pub mod heartbeat;
pub mod reaper;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::metrics::WorkerMetrics;
use crate::store::location::BlockLocation;
use crate::store::lock::LockId;
use crate::store::meta::{BlockId, SessionId, StoreMeta};
use crate::store::store::{BlockReader, BlockWriter, TieredBlockStore};
use crate::ufs::bridge::{UfsBlockOptions, UfsBlockReader, UnderStoreBlockBridge};
use crate::ufs::client::{LocalUnderStore, UnderStoreClient};
use crate::worker::cache_manager::{CacheRequest, CacheRequestManager};
use crate::worker::coordinator::{CoordinatorClient, StandaloneCoordinator};
use crate::worker::heartbeat::{HeartbeatReporter, HeartbeatSync};
use crate::worker::reaper::SessionReaper;

/// A reader over a block, wherever its bytes came from.
pub enum AnyBlockReader {
    Local(BlockReader),
    Ufs {
        reader: UfsBlockReader,
        session_id: SessionId,
        block_id: BlockId,
    },
}

impl AnyBlockReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            AnyBlockReader::Local(r) => r.read(buf).await,
            AnyBlockReader::Ufs { reader, .. } => reader.read(buf).await,
        }
    }

    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        match self {
            AnyBlockReader::Local(r) => r.read_to_end(buf).await,
            AnyBlockReader::Ufs { reader, .. } => reader.read_to_end(buf).await,
        }
    }

    /// Whether the bytes are being served from local storage.
    pub fn is_local(&self) -> bool {
        matches!(self, AnyBlockReader::Local(_))
    }
}

#[derive(Clone)]
pub struct BlockWorker {
    store: TieredBlockStore,
    bridge: Arc<UnderStoreBlockBridge>,
    coordinator: Arc<dyn CoordinatorClient>,
    cache: CacheRequestManager,
    reporter: Arc<HeartbeatReporter>,
    metrics: Arc<WorkerMetrics>,
    worker_id: Arc<AtomicU64>,
    cfg: Config,
}

impl BlockWorker {
    pub async fn new(
        cfg: Config,
        coordinator: Arc<dyn CoordinatorClient>,
        ufs: Arc<dyn UnderStoreClient>,
    ) -> Result<Self> {
        let store = TieredBlockStore::open(&cfg).await?;
        let reporter = Arc::new(HeartbeatReporter::new());
        store.register_listener(reporter.clone());
        let metrics = Arc::new(WorkerMetrics::new());
        store.register_listener(metrics.clone());
        let bridge = Arc::new(UnderStoreBlockBridge::new(ufs.clone(), store.clone()));
        let cache = CacheRequestManager::new(store.clone(), ufs, &cfg.cache);
        Ok(Self {
            store,
            bridge,
            coordinator,
            cache,
            reporter,
            metrics,
            worker_id: Arc::new(AtomicU64::new(0)),
            cfg,
        })
    }

    /// Build a self-contained worker: in-process coordinator, local
    /// filesystem under store.
    pub async fn standalone(cfg: Config) -> Result<Self> {
        let coordinator = Arc::new(StandaloneCoordinator::new());
        let ufs = Arc::new(LocalUnderStore::new(cfg.ufs.root.clone()));
        Self::new(cfg, coordinator, ufs).await
    }

    /// Build the heartbeat loop driver for this worker.
    pub fn heartbeat_sync(&self) -> HeartbeatSync {
        HeartbeatSync::new(
            self.store.clone(),
            self.coordinator.clone(),
            self.reporter.clone(),
            self.worker_id.clone(),
            self.cfg.server.listen.clone(),
            self.cfg.heartbeat.clone(),
        )
    }

    /// Register with the coordinator and spawn the background loops:
    /// heartbeat, session reaper, storage checker.
    pub async fn start(&self) -> Result<()> {
        let sync = self.heartbeat_sync();
        sync.acquire_worker_id().await?;
        tokio::spawn(sync.run());

        let reaper = SessionReaper::new(
            self.store.clone(),
            self.bridge.clone(),
            self.cfg.session.clone(),
        );
        tokio::spawn(reaper.run());

        let store = self.store.clone();
        let check_interval = Duration::from_millis(self.cfg.session.storage_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.remove_inaccessible_storage().await;
            }
        });

        info!(worker_id = self.worker_id(), "Block worker started");
        Ok(())
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &TieredBlockStore {
        &self.store
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Client keepalive: stamps session activity.
    pub fn session_heartbeat(&self, session_id: SessionId) {
        self.store.sessions().touch(session_id);
        self.sync_active_clients();
    }

    fn sync_active_clients(&self) {
        self.metrics
            .active_clients
            .set(self.store.sessions().count() as i64);
    }

    pub async fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        size: u64,
        hint: BlockLocation,
    ) -> Result<PathBuf> {
        let path = self.store.create_block(session_id, block_id, size, hint).await?;
        self.sync_active_clients();
        Ok(path)
    }

    pub async fn create_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<BlockWriter> {
        self.store.create_block_writer(session_id, block_id).await
    }

    /// Commit locally, then record the block with the coordinator so other
    /// clients can locate it immediately. A coordinator failure surfaces as
    /// `Unavailable`; the block stays committed locally and the next
    /// heartbeat will reconcile.
    pub async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        pin_on_create: bool,
    ) -> Result<Option<LockId>> {
        let pin = self
            .store
            .commit_block(session_id, block_id, pin_on_create)
            .await?;
        let (size, alias) = self
            .store
            .block_summary(block_id)
            .await
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if let Err(e) = self
            .coordinator
            .commit_block(self.worker_id(), block_id, &alias, size)
            .await
        {
            warn!(block_id, error = %e, "Coordinator commit failed, heartbeat will reconcile");
            if let Some(lock_id) = pin {
                self.store.locks().unlock(lock_id);
            }
            return Err(StoreError::Unavailable(format!(
                "commit of block {block_id} not acknowledged: {e}"
            )));
        }
        Ok(pin)
    }

    pub async fn abort_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        self.store.abort_block(session_id, block_id).await
    }

    /// Read a locally resident block. Misses surface as `BlockNotFound`;
    /// the caller falls back to `open_ufs_block` + `create_ufs_reader`.
    pub async fn create_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<BlockReader> {
        let reader = self
            .store
            .create_block_reader(session_id, block_id, offset)
            .await?;
        self.sync_active_clients();
        Ok(reader)
    }

    pub async fn remove_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        self.store.remove_block(session_id, block_id).await
    }

    pub async fn request_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        extra: u64,
    ) -> Result<()> {
        self.store.request_space(session_id, block_id, extra).await
    }

    /// Read a block from wherever it lives: the local store when resident,
    /// otherwise streamed from the under store when `fallback` carries the
    /// block's location there. Finish with `close_reader`.
    pub async fn read_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
        fallback: Option<UfsBlockOptions>,
    ) -> Result<AnyBlockReader> {
        match self.store.create_block_reader(session_id, block_id, offset).await {
            Ok(reader) => Ok(AnyBlockReader::Local(reader)),
            Err(StoreError::BlockNotFound(_)) => {
                let opts = fallback.ok_or(StoreError::BlockNotFound(block_id))?;
                match self.open_ufs_block(session_id, block_id, opts) {
                    Ok(()) | Err(StoreError::BlockAlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                let reader = match self.bridge.create_reader(session_id, block_id, offset).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.bridge.close_block(session_id, block_id);
                        return Err(e);
                    }
                };
                Ok(AnyBlockReader::Ufs {
                    reader,
                    session_id,
                    block_id,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Release a reader obtained from `read_block`, including the bridge
    /// handle for under-store reads.
    pub async fn close_reader(&self, reader: AnyBlockReader) {
        match reader {
            AnyBlockReader::Local(r) => r.close(),
            AnyBlockReader::Ufs {
                reader,
                session_id,
                block_id,
            } => {
                reader.close().await;
                self.bridge.close_block(session_id, block_id);
            }
        }
    }

    pub fn open_ufs_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        opts: UfsBlockOptions,
    ) -> Result<()> {
        self.store.sessions().touch(session_id);
        self.bridge.open_block(session_id, block_id, opts)
    }

    pub async fn create_ufs_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<UfsBlockReader> {
        self.bridge.create_reader(session_id, block_id, offset).await
    }

    pub fn close_ufs_block(&self, session_id: SessionId, block_id: BlockId) -> bool {
        self.bridge.close_block(session_id, block_id)
    }

    /// Populate one block from the under store and wait for it.
    pub async fn cache_block(&self, request: CacheRequest) -> Result<()> {
        self.cache.cache(request).await
    }

    /// Queue a background populate.
    pub async fn cache_block_async(&self, request: CacheRequest) {
        self.cache.submit(request).await;
    }

    /// Bulk-populate a batch of blocks concurrently. Returns the ids that
    /// failed, with their errors; already-resident blocks count as success.
    pub async fn load(&self, requests: Vec<CacheRequest>) -> Vec<(BlockId, StoreError)> {
        let results = join_all(requests.into_iter().map(|req| {
            let cache = self.cache.clone();
            async move {
                let block_id = req.block_id;
                match cache.cache(req).await {
                    Ok(()) | Err(StoreError::BlockAlreadyExists(_)) => None,
                    Err(e) => Some((block_id, e)),
                }
            }
        }))
        .await;
        results.into_iter().flatten().collect()
    }

    pub async fn cleanup_session(&self, session_id: SessionId) {
        self.bridge.close_all_for_session(session_id);
        self.store.cleanup_session(session_id).await;
        self.sync_active_clients();
    }

    /// Usage snapshot; also refreshes the capacity gauges.
    pub async fn store_meta(&self) -> StoreMeta {
        let meta = self.store.store_meta().await;
        self.metrics.used_bytes.set(meta.used_bytes as i64);
        self.metrics.capacity_bytes.set(meta.capacity_bytes as i64);
        meta
    }
}
