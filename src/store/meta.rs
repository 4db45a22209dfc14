//! Block and session identity plus per-block metadata records.
//!
//! A block is either absent, a temp block under active write by exactly one
//! session, or a committed block visible to all sessions, and never more
//! than one of these at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::store::location::DirId;

/// Process-global unique identifier for a unit of cached content.
pub type BlockId = u64;

/// Identifies a client's logical connection scope.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique session ID for internally driven work
/// (cache population, bulk loads).
pub fn new_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Metadata for a block under active write.
///
/// Exists only while the owning session is writing; invisible to readers.
#[derive(Debug, Clone)]
pub struct TempBlockMeta {
    pub block_id: BlockId,
    pub session_id: SessionId,
    pub dir: DirId,
    /// Bytes reserved in the directory for this block. Grows through
    /// `request_space`; the committed size may end up smaller.
    pub reserved_bytes: u64,
    /// Path of the temp file being written.
    pub path: PathBuf,
}

/// Metadata for a committed block. Size is immutable once committed.
#[derive(Debug, Clone)]
pub struct CommittedBlockMeta {
    pub block_id: BlockId,
    pub dir: DirId,
    pub size: u64,
    pub path: PathBuf,
    /// Millis since store start at last access. Shared so readers can touch
    /// it without the metadata writer lock.
    last_access_ms: Arc<AtomicU64>,
}

impl CommittedBlockMeta {
    pub fn new(block_id: BlockId, dir: DirId, size: u64, path: PathBuf, now_ms: u64) -> Self {
        Self {
            block_id,
            dir,
            size,
            path,
            last_access_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    /// Record an access for LRU accounting.
    pub fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }
}

/// Either kind of block record, as returned by lookups.
#[derive(Debug, Clone)]
pub enum BlockMeta {
    Temp(TempBlockMeta),
    Committed(CommittedBlockMeta),
}

impl BlockMeta {
    pub fn is_committed(&self) -> bool {
        matches!(self, BlockMeta::Committed(_))
    }
}

/// Snapshot of store capacity and usage, served on the admin surface and
/// included in heartbeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreMeta {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub capacity_bytes_on_tiers: HashMap<String, u64>,
    pub used_bytes_on_tiers: HashMap<String, u64>,
    pub block_count: usize,
}

/// Monotonic millisecond clock anchored at store start, used for LRU stamps.
#[derive(Debug, Clone)]
pub struct StoreClock {
    epoch: Instant,
}

impl StoreClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for StoreClock {
    fn default() -> Self {
        Self::new()
    }
}
