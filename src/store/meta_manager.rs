//! The authoritative in-memory index of block locations and states.
//!
//! All mutating calls happen under the store's exclusive metadata lock (the
//! union of the per-directory bookkeeping locks); reads may use a snapshot.
//! Enforced here:
//! - a block id is absent, temp (owned by one session), or committed, and
//!   never more than one of these at a time
//! - a directory's reserved + committed bytes never exceed its capacity

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::store::location::{BlockLocation, DirId};
use crate::store::meta::{
    BlockId, BlockMeta, CommittedBlockMeta, SessionId, StoreClock, StoreMeta, TempBlockMeta,
};
use crate::store::tier::TierCatalog;

pub struct BlockMetadataManager {
    catalog: TierCatalog,
    temp: HashMap<BlockId, TempBlockMeta>,
    committed: HashMap<BlockId, CommittedBlockMeta>,
    /// Blocks exempt from eviction regardless of LRU order.
    pinned: HashSet<BlockId>,
    clock: StoreClock,
}

impl BlockMetadataManager {
    pub fn new(catalog: TierCatalog) -> Self {
        Self {
            catalog,
            temp: HashMap::new(),
            committed: HashMap::new(),
            pinned: HashSet::new(),
            clock: StoreClock::new(),
        }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Register a new temp block owned by `session_id`, reserving `size`
    /// bytes in `dir`.
    pub fn add_temp(
        &mut self,
        session_id: SessionId,
        block_id: BlockId,
        dir: DirId,
        size: u64,
    ) -> Result<TempBlockMeta> {
        if self.temp.contains_key(&block_id) || self.committed.contains_key(&block_id) {
            return Err(StoreError::BlockAlreadyExists(block_id));
        }
        let storage = self
            .catalog
            .dir_mut(dir)
            .filter(|d| d.online)
            .ok_or_else(|| StoreError::Internal(format!("no online storage at {dir}")))?;
        if storage.available() < size {
            return Err(StoreError::OutOfSpace {
                requested: size,
                location: BlockLocation::AnyDirInTier(dir.tier),
            });
        }
        storage.reserve(size);
        storage.temp.insert(block_id);
        let meta = TempBlockMeta {
            block_id,
            session_id,
            dir,
            reserved_bytes: size,
            path: storage.temp_path(block_id),
        };
        self.temp.insert(block_id, meta.clone());
        Ok(meta)
    }

    /// Fetch the temp block, verifying it is owned by `session_id`.
    ///
    /// Fails with `BlockAlreadyCommitted` if the block has already been
    /// committed (idempotency guard against duplicate commit races) and
    /// `BlockNotFound` if no temp record exists.
    pub fn get_temp_owned(
        &self,
        block_id: BlockId,
        session_id: SessionId,
    ) -> Result<TempBlockMeta> {
        if self.committed.contains_key(&block_id) {
            return Err(StoreError::BlockAlreadyCommitted(block_id));
        }
        let meta = self
            .temp
            .get(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if meta.session_id != session_id {
            return Err(StoreError::InvalidState(format!(
                "temp block {block_id} is owned by session {}, not {session_id}",
                meta.session_id
            )));
        }
        Ok(meta.clone())
    }

    /// Promote a temp block to committed with its final size. The caller has
    /// already renamed the temp file into place.
    pub fn commit(
        &mut self,
        block_id: BlockId,
        session_id: SessionId,
        size: u64,
    ) -> Result<CommittedBlockMeta> {
        // Re-validates under the same lock that will apply the swap.
        let temp = self.get_temp_owned(block_id, session_id)?;
        self.temp.remove(&block_id);
        let now = self.clock.now_ms();
        let storage = self
            .catalog
            .dir_mut(temp.dir)
            .ok_or_else(|| StoreError::Internal(format!("lost storage at {}", temp.dir)))?;
        storage.temp.remove(&block_id);
        storage.committed.insert(block_id);
        // Swap the reservation for the actual committed size.
        storage.release(temp.reserved_bytes);
        storage.reserve(size);
        if storage.used > storage.capacity {
            warn!(
                block_id,
                dir = %temp.dir,
                used = storage.used,
                capacity = storage.capacity,
                "Committed size exceeded reservation"
            );
        }
        let path = storage.block_path(block_id);
        let meta = CommittedBlockMeta::new(block_id, temp.dir, size, path, now);
        self.committed.insert(block_id, meta.clone());
        Ok(meta)
    }

    /// Discard a temp block, releasing its reservation.
    pub fn abort(&mut self, block_id: BlockId, session_id: SessionId) -> Result<TempBlockMeta> {
        let temp = self.get_temp_owned(block_id, session_id)?;
        self.temp.remove(&block_id);
        if let Some(storage) = self.catalog.dir_mut(temp.dir) {
            storage.temp.remove(&block_id);
            storage.release(temp.reserved_bytes);
        }
        Ok(temp)
    }

    /// Drop a committed block's metadata and free its bytes. Lock checks are
    /// the caller's responsibility.
    pub fn remove_committed(&mut self, block_id: BlockId) -> Result<CommittedBlockMeta> {
        let meta = self
            .committed
            .remove(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if let Some(storage) = self.catalog.dir_mut(meta.dir) {
            storage.committed.remove(&block_id);
            storage.release(meta.size);
        }
        self.pinned.remove(&block_id);
        Ok(meta)
    }

    /// Grow a temp block's reservation in place.
    pub fn extend_temp(
        &mut self,
        block_id: BlockId,
        session_id: SessionId,
        extra: u64,
    ) -> Result<()> {
        let temp = self.get_temp_owned(block_id, session_id)?;
        let storage = self
            .catalog
            .dir_mut(temp.dir)
            .ok_or_else(|| StoreError::Internal(format!("lost storage at {}", temp.dir)))?;
        if storage.available() < extra {
            return Err(StoreError::OutOfSpace {
                requested: extra,
                location: BlockLocation::AnyDirInTier(temp.dir.tier),
            });
        }
        storage.reserve(extra);
        if let Some(t) = self.temp.get_mut(&block_id) {
            t.reserved_bytes += extra;
        }
        Ok(())
    }

    pub fn lookup(&self, block_id: BlockId) -> Option<BlockMeta> {
        if let Some(t) = self.temp.get(&block_id) {
            return Some(BlockMeta::Temp(t.clone()));
        }
        self.committed
            .get(&block_id)
            .map(|c| BlockMeta::Committed(c.clone()))
    }

    pub fn get_committed(&self, block_id: BlockId) -> Option<CommittedBlockMeta> {
        self.committed.get(&block_id).cloned()
    }

    pub fn get_temp(&self, block_id: BlockId) -> Option<TempBlockMeta> {
        self.temp.get(&block_id).cloned()
    }

    /// Committed blocks resident in one directory.
    pub fn committed_in_dir(&self, dir: DirId) -> Vec<&CommittedBlockMeta> {
        match self.catalog.dir(dir) {
            Some(storage) => storage
                .committed
                .iter()
                .filter_map(|id| self.committed.get(id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Temp blocks owned by one session.
    pub fn temp_blocks_of_session(&self, session_id: SessionId) -> Vec<BlockId> {
        self.temp
            .values()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.block_id)
            .collect()
    }

    /// All committed blocks with their tier alias, for full inventory reports.
    pub fn committed_blocks(&self) -> Vec<(BlockId, String)> {
        self.committed
            .values()
            .map(|c| (c.block_id, self.catalog.alias(c.dir.tier).to_string()))
            .collect()
    }

    /// Replace the set of eviction-exempt blocks.
    pub fn update_pinned(&mut self, ids: HashSet<BlockId>) {
        self.pinned = ids;
    }

    pub fn is_pinned(&self, block_id: BlockId) -> bool {
        self.pinned.contains(&block_id)
    }

    /// Take a directory offline and drop its residents from the catalog.
    /// Returns the committed blocks lost.
    pub fn take_offline(&mut self, dir: DirId) -> Vec<BlockId> {
        let (lost_committed, lost_temp) = match self.catalog.dir_mut(dir) {
            Some(storage) => {
                storage.online = false;
                storage.used = 0;
                (
                    storage.committed.drain().collect::<Vec<_>>(),
                    storage.temp.drain().collect::<Vec<_>>(),
                )
            }
            None => return Vec::new(),
        };
        for id in &lost_committed {
            self.committed.remove(id);
            self.pinned.remove(id);
        }
        for id in &lost_temp {
            self.temp.remove(id);
        }
        lost_committed
    }

    /// Capacity/usage snapshot across tiers.
    pub fn store_meta(&self) -> StoreMeta {
        let mut meta = StoreMeta {
            block_count: self.committed.len(),
            ..Default::default()
        };
        for tier in &self.catalog.tiers {
            let capacity: u64 = tier.dirs.iter().filter(|d| d.online).map(|d| d.capacity).sum();
            let used: u64 = tier.dirs.iter().filter(|d| d.online).map(|d| d.used).sum();
            meta.capacity_bytes += capacity;
            meta.used_bytes += used;
            meta.capacity_bytes_on_tiers
                .insert(tier.alias.clone(), capacity);
            meta.used_bytes_on_tiers.insert(tier.alias.clone(), used);
        }
        meta
    }
}
