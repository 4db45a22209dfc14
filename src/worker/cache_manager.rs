//! Cache population: pulls block ranges from the under store into local
//! storage through a bounded worker pool.
//!
//! Requests for a block already resident or already being populated are
//! deduplicated: a synchronous caller gets `BlockAlreadyExists`, an async
//! submission is a logged no-op.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{Result, StoreError};
use crate::store::location::BlockLocation;
use crate::store::meta::{new_session_id, BlockId, SessionId};
use crate::store::store::TieredBlockStore;
use crate::ufs::client::UnderStoreClient;

/// One cache-population request.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub block_id: BlockId,
    /// Under-store file holding the block's bytes.
    pub ufs_path: String,
    /// Byte offset of the block within that file.
    pub offset_in_file: u64,
    pub block_size: u64,
    pub hint: BlockLocation,
}

#[derive(Clone)]
pub struct CacheRequestManager {
    store: TieredBlockStore,
    client: Arc<dyn UnderStoreClient>,
    pool: Arc<Semaphore>,
    inflight: Arc<Mutex<HashSet<BlockId>>>,
    chunk_size: usize,
}

/// Releases the in-flight claim when a populate finishes, however it ends.
struct InflightGuard {
    set: Arc<Mutex<HashSet<BlockId>>>,
    block_id: BlockId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("inflight set poisoned")
            .remove(&self.block_id);
    }
}

impl CacheRequestManager {
    pub fn new(
        store: TieredBlockStore,
        client: Arc<dyn UnderStoreClient>,
        cfg: &CacheConfig,
    ) -> Self {
        Self {
            store,
            client,
            pool: Arc::new(Semaphore::new(cfg.max_concurrent_requests)),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            chunk_size: cfg.chunk_size_bytes,
        }
    }

    fn claim(&self, block_id: BlockId) -> Option<InflightGuard> {
        let mut set = self.inflight.lock().expect("inflight set poisoned");
        if !set.insert(block_id) {
            return None;
        }
        Some(InflightGuard {
            set: self.inflight.clone(),
            block_id,
        })
    }

    /// Populate a block and wait for the result.
    pub async fn cache(&self, request: CacheRequest) -> Result<()> {
        if let Some(meta) = self.store.lookup(request.block_id).await {
            if meta.is_committed() {
                return Err(StoreError::BlockAlreadyExists(request.block_id));
            }
        }
        let guard = self
            .claim(request.block_id)
            .ok_or(StoreError::BlockAlreadyExists(request.block_id))?;
        let result = self.populate(&request).await;
        drop(guard);
        result
    }

    /// Queue a populate in the background. Duplicate submissions are a
    /// logged no-op; failures are logged, not surfaced.
    pub async fn submit(&self, request: CacheRequest) {
        if let Some(meta) = self.store.lookup(request.block_id).await {
            if meta.is_committed() {
                debug!(block_id = request.block_id, "Block already cached, dropping request");
                return;
            }
        }
        let guard = match self.claim(request.block_id) {
            Some(g) => g,
            None => {
                debug!(block_id = request.block_id, "Cache already in flight, dropping request");
                return;
            }
        };
        let manager = self.clone();
        tokio::spawn(async move {
            let block_id = request.block_id;
            if let Err(e) = manager.populate(&request).await {
                warn!(block_id, error = %e, "Background cache request failed");
            }
            drop(guard);
        });
    }

    /// Populate operations currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("inflight set poisoned").len()
    }

    async fn populate(&self, request: &CacheRequest) -> Result<()> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| StoreError::Internal("cache pool closed".into()))?;

        let session_id = new_session_id();
        self.store
            .create_block(
                session_id,
                request.block_id,
                request.block_size,
                request.hint,
            )
            .await?;

        match self.copy_in(session_id, request).await {
            Ok(()) => {
                self.store
                    .commit_block(session_id, request.block_id, false)
                    .await?;
                info!(
                    block_id = request.block_id,
                    size = request.block_size,
                    "Cached block from under store"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort_block(session_id, request.block_id).await {
                    warn!(block_id = request.block_id, error = %abort_err, "Abort after failed populate");
                }
                Err(e)
            }
        }
    }

    async fn copy_in(&self, session_id: SessionId, request: &CacheRequest) -> Result<()> {
        let mut writer = self
            .store
            .create_block_writer(session_id, request.block_id)
            .await?;
        let mut reader = self
            .client
            .open_range(
                &request.ufs_path,
                request.offset_in_file,
                request.block_size,
            )
            .await?;

        let mut chunk = vec![0u8; self.chunk_size.min(request.block_size as usize).max(1)];
        let mut copied = 0u64;
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut reader, &mut chunk)
                .await
                .map_err(|e| StoreError::Unavailable(format!("ufs read: {e}")))?;
            if n == 0 {
                break;
            }
            writer.append(&chunk[..n]).await?;
            copied += n as u64;
        }
        if copied != request.block_size {
            return Err(StoreError::Unavailable(format!(
                "under store returned {copied} of {} bytes for block {}",
                request.block_size, request.block_id
            )));
        }
        writer.flush().await
    }
}
