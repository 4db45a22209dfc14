//! The tiered block store: orchestrates metadata, allocation, locking and
//! sessions into the public block lifecycle API.
//!
//! Lifecycle: a temp block is created by `create_block`, written through a
//! `BlockWriter`, then promoted by `commit_block` (atomic swap under the
//! bookkeeping lock) or discarded by `abort_block`. Committed blocks are
//! served through read-locked `BlockReader`s and destroyed by explicit
//! removal or eviction. Every state change notifies the registered event
//! listeners (heartbeat reporter, metrics reporter).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::store::alloc::{Allocation, SpaceAllocator};
use crate::store::location::BlockLocation;
use crate::store::lock::{LockId, LockMode, SessionLockManager};
use crate::store::meta::{
    BlockId, BlockMeta, CommittedBlockMeta, SessionId, StoreMeta, TempBlockMeta,
};
use crate::store::meta_manager::BlockMetadataManager;
use crate::store::session::Sessions;
use crate::store::tier::TierCatalog;

/// Observers of block state transitions. Subscribers are invoked
/// synchronously on the calling task; ordering among subscribers is
/// unspecified.
pub trait BlockStoreEventListener: Send + Sync {
    fn on_commit(&self, _block_id: BlockId, _tier_alias: &str) {}
    fn on_abort(&self, _block_id: BlockId) {}
    fn on_remove(&self, _block_id: BlockId) {}
    fn on_evict(&self, _block_id: BlockId) {}
    fn on_block_lost(&self, _block_id: BlockId) {}
}

struct StoreInner {
    /// The bookkeeping lock: all metadata and per-dir byte accounting is
    /// mutated under it. Held across local fs metadata ops (rename) but
    /// never across eviction unlinks or network calls.
    meta: RwLock<BlockMetadataManager>,
    locks: SessionLockManager,
    sessions: Sessions,
    allocator: SpaceAllocator,
    listeners: StdMutex<Vec<Arc<dyn BlockStoreEventListener>>>,
}

/// Cheaply cloneable handle to the store.
#[derive(Clone)]
pub struct TieredBlockStore {
    inner: Arc<StoreInner>,
}

impl TieredBlockStore {
    /// Open the store: builds the tier catalog (creating directories) and
    /// wires up allocation and locking from configuration.
    pub async fn open(cfg: &Config) -> Result<Self> {
        let catalog = TierCatalog::open(&cfg.tiers).await?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                meta: RwLock::new(BlockMetadataManager::new(catalog)),
                locks: SessionLockManager::new(Duration::from_millis(
                    cfg.locks.acquire_timeout_ms,
                )),
                sessions: Sessions::new(),
                allocator: SpaceAllocator::from_config(&cfg.eviction),
                listeners: StdMutex::new(Vec::new()),
            }),
        })
    }

    pub fn register_listener(&self, listener: Arc<dyn BlockStoreEventListener>) {
        self.inner
            .listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    fn emit(&self, f: impl Fn(&dyn BlockStoreEventListener)) {
        let listeners: Vec<Arc<dyn BlockStoreEventListener>> = self
            .inner
            .listeners
            .lock()
            .expect("listener list poisoned")
            .clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    pub fn locks(&self) -> &SessionLockManager {
        &self.inner.locks
    }

    pub fn sessions(&self) -> &Sessions {
        &self.inner.sessions
    }

    /// Allocate space and register a temp block for `session_id`.
    /// Returns the path the caller may write to through a `BlockWriter`.
    pub async fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        size: u64,
        hint: BlockLocation,
    ) -> Result<PathBuf> {
        self.inner.sessions.touch(session_id);
        let (created, evicted) = {
            let mut meta = self.inner.meta.write().await;
            if meta.lookup(block_id).is_some() {
                return Err(StoreError::BlockAlreadyExists(block_id));
            }
            let locks = &self.inner.locks;
            match self
                .inner
                .allocator
                .allocate(&meta, size, hint, &|id| locks.is_locked(id))
            {
                Allocation::Fit(dir) => {
                    (meta.add_temp(session_id, block_id, dir, size), Vec::new())
                }
                Allocation::Evict { dir, victims } => {
                    let mut evicted = Vec::new();
                    for victim in victims {
                        match meta.remove_committed(victim.block_id) {
                            Ok(m) => evicted.push(m),
                            Err(e) => {
                                warn!(block_id = victim.block_id, error = %e, "Eviction victim vanished")
                            }
                        }
                    }
                    (meta.add_temp(session_id, block_id, dir, size), evicted)
                }
                Allocation::Exhausted => (
                    Err(StoreError::OutOfSpace {
                        requested: size,
                        location: hint,
                    }),
                    Vec::new(),
                ),
            }
        };

        // Victim files are unlinked outside the bookkeeping lock.
        for victim in &evicted {
            if let Err(e) = fs::remove_file(&victim.path).await {
                warn!(block_id = victim.block_id, error = %e, "Failed to unlink evicted block file");
            }
            debug!(block_id = victim.block_id, "Evicted block");
        }
        for victim in &evicted {
            self.emit(|l| l.on_evict(victim.block_id));
        }

        let temp = created?;
        if let Err(e) = File::create(&temp.path).await {
            // Roll back the reservation; no leaked space on failure.
            let mut meta = self.inner.meta.write().await;
            let _ = meta.abort(block_id, session_id);
            return Err(e.into());
        }
        debug!(block_id, session_id, size, dir = %temp.dir, "Created temp block");
        Ok(temp.path)
    }

    /// Open a sequential append-only writer bound to the session's temp
    /// block.
    pub async fn create_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<BlockWriter> {
        self.inner.sessions.touch(session_id);
        let temp = {
            let meta = self.inner.meta.read().await;
            meta.get_temp_owned(block_id, session_id)?
        };
        let file = OpenOptions::new().append(true).open(&temp.path).await?;
        let pos = file.metadata().await?.len();
        Ok(BlockWriter {
            store: self.clone(),
            session_id,
            block_id,
            file,
            pos,
            reserved: temp.reserved_bytes,
        })
    }

    /// Promote the session's temp block to committed.
    ///
    /// With `pin_on_create`, a READ lock is acquired on the caller's behalf
    /// before the swap so the fresh block cannot be evicted until the caller
    /// unlocks the returned lock id.
    pub async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        pin_on_create: bool,
    ) -> Result<Option<LockId>> {
        self.inner.sessions.touch(session_id);
        let pin = if pin_on_create {
            Some(
                self.inner
                    .locks
                    .lock_block(session_id, block_id, LockMode::Read)
                    .await?,
            )
        } else {
            None
        };

        match self.commit_inner(session_id, block_id).await {
            Ok((committed, alias)) => {
                info!(block_id, session_id, size = committed.size, tier = %alias, "Committed block");
                self.emit(|l| l.on_commit(block_id, &alias));
                Ok(pin)
            }
            Err(e) => {
                if let Some(lock_id) = pin {
                    self.inner.locks.unlock(lock_id);
                }
                Err(e)
            }
        }
    }

    async fn commit_inner(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(CommittedBlockMeta, String)> {
        let mut meta = self.inner.meta.write().await;
        let temp = meta.get_temp_owned(block_id, session_id)?;
        let size = fs::metadata(&temp.path).await?.len();
        let dest = meta
            .catalog()
            .dir(temp.dir)
            .ok_or_else(|| StoreError::Internal(format!("lost storage at {}", temp.dir)))?
            .block_path(block_id);
        fs::rename(&temp.path, &dest).await?;
        let committed = meta.commit(block_id, session_id, size)?;
        let alias = meta.catalog().alias(temp.dir.tier).to_string();
        Ok((committed, alias))
    }

    /// Discard the session's temp block and release its reservation.
    pub async fn abort_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        self.inner.sessions.touch(session_id);
        let temp = {
            let mut meta = self.inner.meta.write().await;
            meta.abort(block_id, session_id)?
        };
        if let Err(e) = fs::remove_file(&temp.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(block_id, error = %e, "Failed to unlink aborted temp file");
            }
        }
        debug!(block_id, session_id, "Aborted temp block");
        self.emit(|l| l.on_abort(block_id));
        Ok(())
    }

    /// Open a reader over a committed block at `offset`, holding a READ lock
    /// for the reader's lifetime. Fails with `BlockNotFound` when the block
    /// is not resident; the caller decides whether to fall back to the
    /// under-store bridge.
    pub async fn create_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<BlockReader> {
        self.inner.sessions.touch(session_id);
        let lock_id = self
            .inner
            .locks
            .lock_block(session_id, block_id, LockMode::Read)
            .await?;

        let committed = {
            let meta = self.inner.meta.read().await;
            match meta.get_committed(block_id) {
                Some(c) => {
                    c.touch(meta.now_ms());
                    c
                }
                None => {
                    self.inner.locks.unlock(lock_id);
                    return Err(StoreError::BlockNotFound(block_id));
                }
            }
        };

        if offset > committed.size {
            self.inner.locks.unlock(lock_id);
            return Err(StoreError::InvalidState(format!(
                "read offset {offset} beyond block {block_id} size {}",
                committed.size
            )));
        }

        let mut file = match File::open(&committed.path).await {
            Ok(f) => f,
            Err(e) => {
                self.inner.locks.unlock(lock_id);
                return Err(e.into());
            }
        };
        if offset > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
                self.inner.locks.unlock(lock_id);
                return Err(e.into());
            }
        }

        Ok(BlockReader {
            store: self.clone(),
            block_id,
            size: committed.size,
            lock_id,
            released: false,
            file,
        })
    }

    /// Remove a committed block and free its space. Fails with `BlockInUse`
    /// while any lock is outstanding.
    pub async fn remove_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        self.inner.sessions.touch(session_id);
        let removed = {
            let mut meta = self.inner.meta.write().await;
            // Checked under the bookkeeping lock: a reader acquires its lock
            // before looking up metadata, so it either shows up here or will
            // observe the block as gone.
            if self.inner.locks.is_locked(block_id) {
                return Err(StoreError::BlockInUse(block_id));
            }
            meta.remove_committed(block_id)?
        };
        if let Err(e) = fs::remove_file(&removed.path).await {
            warn!(block_id, error = %e, "Failed to unlink removed block file");
        }
        info!(block_id, "Removed block");
        self.emit(|l| l.on_remove(block_id));
        Ok(())
    }

    /// Extend a temp block's reservation in place, evicting within its
    /// directory if needed.
    pub async fn request_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        extra: u64,
    ) -> Result<()> {
        self.inner.sessions.touch(session_id);
        let evicted = {
            let mut meta = self.inner.meta.write().await;
            match meta.extend_temp(block_id, session_id, extra) {
                Ok(()) => Vec::new(),
                Err(StoreError::OutOfSpace { .. }) => {
                    let temp = meta.get_temp_owned(block_id, session_id)?;
                    let locks = &self.inner.locks;
                    let victims = self
                        .inner
                        .allocator
                        .plan_eviction(&meta, temp.dir, extra, &|id| locks.is_locked(id))
                        .ok_or(StoreError::OutOfSpace {
                            requested: extra,
                            location: BlockLocation::AnyDirInTier(temp.dir.tier),
                        })?;
                    let mut evicted = Vec::new();
                    for victim in victims {
                        match meta.remove_committed(victim.block_id) {
                            Ok(m) => evicted.push(m),
                            Err(e) => {
                                warn!(block_id = victim.block_id, error = %e, "Eviction victim vanished")
                            }
                        }
                    }
                    meta.extend_temp(block_id, session_id, extra)?;
                    evicted
                }
                Err(e) => return Err(e),
            }
        };
        for victim in &evicted {
            if let Err(e) = fs::remove_file(&victim.path).await {
                warn!(block_id = victim.block_id, error = %e, "Failed to unlink evicted block file");
            }
            debug!(block_id = victim.block_id, "Evicted block");
        }
        for victim in &evicted {
            self.emit(|l| l.on_evict(victim.block_id));
        }
        Ok(())
    }

    /// Replace the set of blocks exempt from eviction.
    pub async fn update_pinned_blocks(&self, ids: HashSet<BlockId>) {
        self.inner.meta.write().await.update_pinned(ids);
    }

    /// Abort all of the session's temp blocks and release all its locks.
    /// Idempotent; individual failures are benign.
    pub async fn cleanup_session(&self, session_id: SessionId) {
        let temp_ids = {
            let meta = self.inner.meta.read().await;
            meta.temp_blocks_of_session(session_id)
        };
        for block_id in temp_ids {
            if let Err(e) = self.abort_block(session_id, block_id).await {
                debug!(session_id, block_id, error = %e, "Cleanup abort was a no-op");
            }
        }
        let released = self.inner.locks.unlock_all_for_session(session_id);
        if released > 0 {
            debug!(session_id, released, "Released locks for session");
        }
        self.inner.sessions.remove(session_id);
    }

    /// Probe each storage directory; any that fails is taken offline and its
    /// resident blocks dropped from the catalog (best effort, no byte
    /// recovery).
    pub async fn remove_inaccessible_storage(&self) {
        let dirs: Vec<_> = {
            let meta = self.inner.meta.read().await;
            meta.catalog()
                .online_dirs()
                .map(|d| (d.id, d.path.clone()))
                .collect()
        };
        for (dir, path) in dirs {
            if let Err(e) = TierCatalog::probe(&path).await {
                warn!(dir = %dir, path = %path.display(), error = %e, "Storage dir failed liveness probe, taking offline");
                let lost = {
                    let mut meta = self.inner.meta.write().await;
                    meta.take_offline(dir)
                };
                for block_id in lost {
                    self.emit(|l| l.on_block_lost(block_id));
                }
            }
        }
    }

    pub async fn store_meta(&self) -> StoreMeta {
        self.inner.meta.read().await.store_meta()
    }

    pub async fn lookup(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.inner.meta.read().await.lookup(block_id)
    }

    pub async fn get_temp_meta(&self, block_id: BlockId) -> Option<TempBlockMeta> {
        self.inner.meta.read().await.get_temp(block_id)
    }

    /// All committed blocks with their tier alias (full inventory report).
    pub async fn committed_blocks(&self) -> Vec<(BlockId, String)> {
        self.inner.meta.read().await.committed_blocks()
    }

    /// Size and tier alias of a committed block.
    pub async fn block_summary(&self, block_id: BlockId) -> Option<(u64, String)> {
        let meta = self.inner.meta.read().await;
        meta.get_committed(block_id)
            .map(|c| (c.size, meta.catalog().alias(c.dir.tier).to_string()))
    }
}

/// Sequential append-only writer for a temp block.
///
/// Writing past the reserved size requests an online extension through the
/// allocator; the write fails with `OutOfSpace` when extension is impossible.
pub struct BlockWriter {
    store: TieredBlockStore,
    session_id: SessionId,
    block_id: BlockId,
    file: File,
    pos: u64,
    reserved: u64,
}

impl BlockWriter {
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let end = self.pos + data.len() as u64;
        if end > self.reserved {
            let extra = end - self.reserved;
            self.store
                .request_space(self.session_id, self.block_id, extra)
                .await?;
            self.reserved += extra;
        }
        self.file.write_all(data).await?;
        self.pos = end;
        Ok(())
    }

    /// Current write offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Reader over a committed block. Holds a READ lock that is released when
/// the reader is dropped, so the block cannot be evicted or removed while
/// reads are in flight.
pub struct BlockReader {
    store: TieredBlockStore,
    pub block_id: BlockId,
    size: u64,
    lock_id: LockId,
    released: bool,
    file: File,
}

impl BlockReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        Ok(self.file.read_to_end(buf).await?)
    }

    /// Committed size of the block.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the read lock eagerly instead of waiting for drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.store.inner.locks.unlock(self.lock_id);
            self.released = true;
        }
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.release();
    }
}
