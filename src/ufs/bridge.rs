//! Bridge between the local store and the under store.
//!
//! A client that misses locally opens the block here, reads it as a stream
//! from the under store, and closes it when done. Open blocks are refcounted
//! per session so concurrent readers of the same block share one registry
//! entry. When a reader streams the full block from offset zero, the bytes
//! are teed into a local temp block and committed, so the next read is a
//! local hit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::location::BlockLocation;
use crate::store::meta::{new_session_id, BlockId, SessionId};
use crate::store::store::{BlockWriter, TieredBlockStore};
use crate::ufs::client::UnderStoreClient;

/// How to find a block inside the under store.
#[derive(Debug, Clone)]
pub struct UfsBlockOptions {
    /// Under-store file holding the block.
    pub ufs_path: String,
    /// Byte offset of the block within that file.
    pub offset_in_file: u64,
    /// Full size of the block.
    pub block_size: u64,
    /// Whether a full sequential read should populate the local store.
    pub cache_on_read: bool,
}

struct BridgeEntry {
    sessions: HashSet<SessionId>,
    opts: UfsBlockOptions,
}

pub struct UnderStoreBlockBridge {
    client: Arc<dyn UnderStoreClient>,
    store: TieredBlockStore,
    entries: Mutex<HashMap<BlockId, BridgeEntry>>,
}

impl UnderStoreBlockBridge {
    pub fn new(client: Arc<dyn UnderStoreClient>, store: TieredBlockStore) -> Self {
        Self {
            client,
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register the session as a reader of the block. Fails with
    /// `BlockAlreadyExists` when the same session opens the block twice
    /// without closing it.
    pub fn open_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        opts: UfsBlockOptions,
    ) -> Result<()> {
        let mut entries = self.entries.lock().expect("bridge registry poisoned");
        let entry = entries.entry(block_id).or_insert_with(|| BridgeEntry {
            sessions: HashSet::new(),
            opts,
        });
        if !entry.sessions.insert(session_id) {
            return Err(StoreError::BlockAlreadyExists(block_id));
        }
        debug!(block_id, session_id, readers = entry.sessions.len(), "Opened ufs block");
        Ok(())
    }

    /// Deregister the session. Returns true when this was the last reader
    /// and the registry entry was dropped. Unknown opens are a benign no-op.
    pub fn close_block(&self, session_id: SessionId, block_id: BlockId) -> bool {
        let mut entries = self.entries.lock().expect("bridge registry poisoned");
        let last = match entries.get_mut(&block_id) {
            Some(entry) => {
                entry.sessions.remove(&session_id);
                entry.sessions.is_empty()
            }
            None => return false,
        };
        if last {
            entries.remove(&block_id);
        }
        debug!(block_id, session_id, last, "Closed ufs block");
        last
    }

    /// Drop every open handle the session holds. Returns how many were
    /// closed.
    pub fn close_all_for_session(&self, session_id: SessionId) -> usize {
        let block_ids: Vec<BlockId> = {
            let entries = self.entries.lock().expect("bridge registry poisoned");
            entries
                .iter()
                .filter(|(_, e)| e.sessions.contains(&session_id))
                .map(|(id, _)| *id)
                .collect()
        };
        let count = block_ids.len();
        for block_id in block_ids {
            self.close_block(session_id, block_id);
        }
        count
    }

    /// Number of sessions currently reading the block through the bridge.
    pub fn reader_count(&self, block_id: BlockId) -> usize {
        self.entries
            .lock()
            .expect("bridge registry poisoned")
            .get(&block_id)
            .map(|e| e.sessions.len())
            .unwrap_or(0)
    }

    /// Open a streaming reader over the block's bytes starting at `offset`.
    /// The block must have been opened by the session first.
    ///
    /// A full read from offset zero with caching enabled tees the stream
    /// into a local temp block; `UfsBlockReader::close` commits it once the
    /// whole block has flowed through.
    pub async fn create_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
    ) -> Result<UfsBlockReader> {
        let opts = {
            let entries = self.entries.lock().expect("bridge registry poisoned");
            let entry = entries.get(&block_id).ok_or_else(|| {
                StoreError::InvalidState(format!(
                    "ufs block {block_id} is not open for session {session_id}"
                ))
            })?;
            if !entry.sessions.contains(&session_id) {
                return Err(StoreError::InvalidState(format!(
                    "ufs block {block_id} is not open for session {session_id}"
                )));
            }
            entry.opts.clone()
        };

        if offset > opts.block_size {
            return Err(StoreError::InvalidState(format!(
                "read offset {offset} beyond ufs block {block_id} size {}",
                opts.block_size
            )));
        }

        let inner = self
            .client
            .open_range(
                &opts.ufs_path,
                opts.offset_in_file + offset,
                opts.block_size - offset,
            )
            .await?;

        let cache = if opts.cache_on_read && offset == 0 {
            self.start_cache(block_id, opts.block_size).await
        } else {
            None
        };

        Ok(UfsBlockReader {
            block_id,
            inner,
            cache,
        })
    }

    /// Set up the tee target for a cache-on-read pass. Any failure to stage
    /// the local copy downgrades to a plain pass-through read.
    async fn start_cache(&self, block_id: BlockId, block_size: u64) -> Option<CacheSink> {
        // The copy is written under an internal session so a client abort
        // cannot orphan it outside the reaper's reach.
        let cache_session = new_session_id();
        match self
            .store
            .create_block(cache_session, block_id, block_size, BlockLocation::AnyTier)
            .await
        {
            Ok(_) => {}
            Err(StoreError::BlockAlreadyExists(_)) => return None,
            Err(e) => {
                debug!(block_id, error = %e, "Skipping cache-on-read");
                return None;
            }
        }
        match self.store.create_block_writer(cache_session, block_id).await {
            Ok(writer) => Some(CacheSink {
                store: self.store.clone(),
                session_id: cache_session,
                block_id,
                writer,
                expected: block_size,
                written: 0,
            }),
            Err(e) => {
                warn!(block_id, error = %e, "Failed to open cache writer");
                let _ = self.store.abort_block(cache_session, block_id).await;
                None
            }
        }
    }
}

struct CacheSink {
    store: TieredBlockStore,
    session_id: SessionId,
    block_id: BlockId,
    writer: BlockWriter,
    expected: u64,
    written: u64,
}

/// Streaming reader over a block resident only in the under store.
///
/// Call `close` when done; it finalizes the cache-on-read copy (commit when
/// the full block was streamed, abort otherwise). A reader dropped without
/// `close` leaves its staged copy to the session reaper.
pub struct UfsBlockReader {
    block_id: BlockId,
    inner: Box<dyn AsyncRead + Send + Unpin>,
    cache: Option<CacheSink>,
}

impl UfsBlockReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .inner
            .read(buf)
            .await
            .map_err(|e| StoreError::Unavailable(format!("ufs read: {e}")))?;
        if n > 0 {
            let mut failed = false;
            if let Some(sink) = &mut self.cache {
                match sink.writer.append(&buf[..n]).await {
                    Ok(()) => sink.written += n as u64,
                    Err(e) => {
                        // Keep serving the client; just give up on the copy.
                        warn!(block_id = self.block_id, error = %e, "Cache-on-read write failed");
                        failed = true;
                    }
                }
            }
            if failed {
                if let Some(sink) = self.cache.take() {
                    let _ = sink.store.abort_block(sink.session_id, sink.block_id).await;
                }
            }
        }
        Ok(n)
    }

    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            buf.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Finalize the reader: commit the staged local copy when complete,
    /// abort it otherwise.
    pub async fn close(mut self) {
        if let Some(mut sink) = self.cache.take() {
            if sink.written == sink.expected {
                if let Err(e) = sink.writer.flush().await {
                    warn!(block_id = sink.block_id, error = %e, "Cache flush failed");
                    let _ = sink.store.abort_block(sink.session_id, sink.block_id).await;
                    return;
                }
                match sink
                    .store
                    .commit_block(sink.session_id, sink.block_id, false)
                    .await
                {
                    Ok(_) => debug!(block_id = sink.block_id, "Cached block from under store"),
                    Err(e) => {
                        warn!(block_id = sink.block_id, error = %e, "Cache commit failed")
                    }
                }
            } else {
                let _ = sink.store.abort_block(sink.session_id, sink.block_id).await;
            }
        }
    }
}
