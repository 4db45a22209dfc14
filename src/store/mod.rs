//! Tiered local block storage.
//!
//! The store keeps blocks as plain files across a configurable hierarchy of
//! storage tiers (memory first, then disk), with an in-memory catalog as the
//! single source of truth for placement and byte accounting.

pub mod alloc;
pub mod location;
pub mod lock;
pub mod meta;
pub mod meta_manager;
pub mod session;
pub mod store;
pub mod tier;

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::location::BlockLocation;
use crate::store::lock::LockId;
use crate::store::meta::{BlockId, BlockMeta, SessionId, StoreMeta};
use crate::store::store::{BlockReader, BlockWriter, TieredBlockStore};

/// The block lifecycle surface the worker layers build on.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        size: u64,
        hint: BlockLocation,
    ) -> Result<PathBuf>;

    async fn create_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<BlockWriter>;

    async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        pin_on_create: bool,
    ) -> Result<Option<LockId>>;

    async fn abort_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()>;

    async fn create_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<BlockReader>;

    async fn remove_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()>;

    async fn request_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        extra: u64,
    ) -> Result<()>;

    async fn update_pinned_blocks(&self, ids: HashSet<BlockId>);

    async fn cleanup_session(&self, session_id: SessionId);

    async fn lookup(&self, block_id: BlockId) -> Option<BlockMeta>;

    async fn store_meta(&self) -> StoreMeta;
}

#[async_trait]
impl BlockStore for TieredBlockStore {
    async fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        size: u64,
        hint: BlockLocation,
    ) -> Result<PathBuf> {
        TieredBlockStore::create_block(self, session_id, block_id, size, hint).await
    }

    async fn create_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<BlockWriter> {
        TieredBlockStore::create_block_writer(self, session_id, block_id).await
    }

    async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        pin_on_create: bool,
    ) -> Result<Option<LockId>> {
        TieredBlockStore::commit_block(self, session_id, block_id, pin_on_create).await
    }

    async fn abort_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        TieredBlockStore::abort_block(self, session_id, block_id).await
    }

    async fn create_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<BlockReader> {
        TieredBlockStore::create_block_reader(self, session_id, block_id, offset).await
    }

    async fn remove_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        TieredBlockStore::remove_block(self, session_id, block_id).await
    }

    async fn request_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        extra: u64,
    ) -> Result<()> {
        TieredBlockStore::request_space(self, session_id, block_id, extra).await
    }

    async fn update_pinned_blocks(&self, ids: HashSet<BlockId>) {
        TieredBlockStore::update_pinned_blocks(self, ids).await
    }

    async fn cleanup_session(&self, session_id: SessionId) {
        TieredBlockStore::cleanup_session(self, session_id).await
    }

    async fn lookup(&self, block_id: BlockId) -> Option<BlockMeta> {
        TieredBlockStore::lookup(self, block_id).await
    }

    async fn store_meta(&self) -> StoreMeta {
        TieredBlockStore::store_meta(self).await
    }
}
