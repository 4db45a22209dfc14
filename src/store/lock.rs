//! Per-block, per-session read/write locks.
//!
//! For a given block, at most one WRITE lock may be outstanding and a WRITE
//! lock excludes all READ locks; READ locks may coexist. Acquisition is async
//! and bounded by a timeout; release is synchronous so reader guards can drop
//! their locks without an executor. Locks are taken one block at a time and
//! never nested, so acquisition cannot deadlock across blocks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::meta::{BlockId, SessionId};

/// Identifies one outstanding lock.
pub type LockId = u64;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => write!(f, "READ"),
            LockMode::Write => write!(f, "WRITE"),
        }
    }
}

#[derive(Debug, Clone)]
struct LockRecord {
    block_id: BlockId,
    session_id: SessionId,
    mode: LockMode,
}

struct BlockEntry {
    readers: usize,
    writer: bool,
    /// Wait queue for this block. Waiters enable their interest before
    /// re-checking grantability, so a release cannot slip past them.
    notify: Arc<Notify>,
}

impl Default for BlockEntry {
    fn default() -> Self {
        Self {
            readers: 0,
            writer: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

impl BlockEntry {
    fn grantable(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn is_free(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

#[derive(Default)]
struct Tables {
    blocks: HashMap<BlockId, BlockEntry>,
    records: HashMap<LockId, LockRecord>,
    by_session: HashMap<SessionId, HashSet<LockId>>,
}

impl Tables {
    fn try_grant(
        &mut self,
        session_id: SessionId,
        block_id: BlockId,
        mode: LockMode,
    ) -> Option<LockId> {
        let entry = self.blocks.entry(block_id).or_default();
        if !entry.grantable(mode) {
            return None;
        }
        match mode {
            LockMode::Read => entry.readers += 1,
            LockMode::Write => entry.writer = true,
        }
        let lock_id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        self.records.insert(
            lock_id,
            LockRecord {
                block_id,
                session_id,
                mode,
            },
        );
        self.by_session
            .entry(session_id)
            .or_default()
            .insert(lock_id);
        Some(lock_id)
    }
}

pub struct SessionLockManager {
    tables: Mutex<Tables>,
    default_timeout: Duration,
}

impl SessionLockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            default_timeout,
        }
    }

    /// Acquire a lock with the configured default timeout.
    pub async fn lock_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        mode: LockMode,
    ) -> Result<LockId> {
        self.lock_block_with_timeout(session_id, block_id, mode, self.default_timeout)
            .await
    }

    /// Acquire a lock, waiting up to `timeout` for conflicting locks to
    /// clear. Fails with `LockTimeout` on expiry.
    pub async fn lock_block_with_timeout(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockId> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut tables = self.tables.lock().expect("lock tables poisoned");
                if let Some(lock_id) = tables.try_grant(session_id, block_id, mode) {
                    return Ok(lock_id);
                }
                tables
                    .blocks
                    .get(&block_id)
                    .map(|e| e.notify.clone())
                    .ok_or_else(|| {
                        StoreError::Internal(format!("lock entry vanished for block {block_id}"))
                    })?
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after enabling: a release between dropping the table
            // lock and enabling would otherwise be missed. The entry may also
            // have been freed and rebuilt in that window, in which case our
            // registration is against a dead wait queue and must be redone.
            {
                let mut tables = self.tables.lock().expect("lock tables poisoned");
                if let Some(lock_id) = tables.try_grant(session_id, block_id, mode) {
                    return Ok(lock_id);
                }
                let stale = tables
                    .blocks
                    .get(&block_id)
                    .map(|e| !Arc::ptr_eq(&e.notify, &notify))
                    .unwrap_or(true);
                if stale {
                    continue;
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                debug!(block_id, session_id, %mode, "Lock acquisition timed out");
                return Err(StoreError::LockTimeout { block_id, mode });
            }
        }
    }

    /// Release one lock. Releasing an unknown id is a benign no-op.
    pub fn unlock(&self, lock_id: LockId) -> bool {
        let mut tables = self.tables.lock().expect("lock tables poisoned");
        let record = match tables.records.remove(&lock_id) {
            Some(r) => r,
            None => return false,
        };
        if let Some(ids) = tables.by_session.get_mut(&record.session_id) {
            ids.remove(&lock_id);
            if ids.is_empty() {
                tables.by_session.remove(&record.session_id);
            }
        }
        if let Some(entry) = tables.blocks.get_mut(&record.block_id) {
            match record.mode {
                LockMode::Read => entry.readers = entry.readers.saturating_sub(1),
                LockMode::Write => entry.writer = false,
            }
            entry.notify.notify_waiters();
            if entry.is_free() {
                tables.blocks.remove(&record.block_id);
            }
        }
        true
    }

    /// Release every lock held by a session. Returns the number released.
    pub fn unlock_all_for_session(&self, session_id: SessionId) -> usize {
        let ids: Vec<LockId> = {
            let tables = self.tables.lock().expect("lock tables poisoned");
            tables
                .by_session
                .get(&session_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        let count = ids.len();
        for id in ids {
            self.unlock(id);
        }
        count
    }

    /// Whether any lock (read or write) is outstanding on the block.
    pub fn is_locked(&self, block_id: BlockId) -> bool {
        let tables = self.tables.lock().expect("lock tables poisoned");
        tables
            .blocks
            .get(&block_id)
            .map(|e| !e.is_free())
            .unwrap_or(false)
    }

    /// (reader count, writer held) for a block.
    pub fn lock_state(&self, block_id: BlockId) -> (usize, bool) {
        let tables = self.tables.lock().expect("lock tables poisoned");
        tables
            .blocks
            .get(&block_id)
            .map(|e| (e.readers, e.writer))
            .unwrap_or((0, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionLockManager {
        SessionLockManager::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_concurrent_readers() {
        let locks = manager();
        let a = locks.lock_block(1, 10, LockMode::Read).await.unwrap();
        let b = locks.lock_block(2, 10, LockMode::Read).await.unwrap();
        assert_eq!(locks.lock_state(10), (2, false));
        locks.unlock(a);
        locks.unlock(b);
        assert!(!locks.is_locked(10));
    }

    #[tokio::test]
    async fn test_writer_excludes_all() {
        let locks = manager();
        let w = locks.lock_block(1, 10, LockMode::Write).await.unwrap();
        assert!(matches!(
            locks.lock_block(2, 10, LockMode::Read).await,
            Err(StoreError::LockTimeout { block_id: 10, .. })
        ));
        assert!(matches!(
            locks.lock_block(2, 10, LockMode::Write).await,
            Err(StoreError::LockTimeout { .. })
        ));
        locks.unlock(w);
        locks.lock_block(2, 10, LockMode::Read).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_waits_for_readers() {
        let locks = Arc::new(manager());
        let r = locks.lock_block(1, 10, LockMode::Read).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .lock_block_with_timeout(2, 10, LockMode::Write, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.unlock(r);

        let w = waiter.await.unwrap().unwrap();
        assert_eq!(locks.lock_state(10), (0, true));
        locks.unlock(w);
    }

    #[tokio::test]
    async fn test_waiter_survives_entry_recycling() {
        let locks = Arc::new(manager());
        let first = locks.lock_block(1, 10, LockMode::Read).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .lock_block_with_timeout(2, 10, LockMode::Write, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Churn the block entry: every release that leaves it free drops it,
        // and the relock rebuilds it with a fresh wait queue. The waiter must
        // still get the lock once the churn stops.
        let mut held = Some(first);
        for _ in 0..50 {
            locks.unlock(held.take().unwrap());
            tokio::task::yield_now().await;
            match locks
                .lock_block_with_timeout(3, 10, LockMode::Read, Duration::from_millis(10))
                .await
            {
                Ok(id) => held = Some(id),
                // The writer got in first; stop churning.
                Err(_) => break,
            }
        }
        if let Some(id) = held {
            locks.unlock(id);
        }

        let w = waiter.await.unwrap().expect("writer starved by entry churn");
        assert_eq!(locks.lock_state(10), (0, true));
        locks.unlock(w);
    }

    #[tokio::test]
    async fn test_unlock_all_for_session() {
        let locks = manager();
        locks.lock_block(7, 1, LockMode::Read).await.unwrap();
        locks.lock_block(7, 2, LockMode::Read).await.unwrap();
        locks.lock_block(8, 3, LockMode::Write).await.unwrap();

        assert_eq!(locks.unlock_all_for_session(7), 2);
        assert!(!locks.is_locked(1));
        assert!(!locks.is_locked(2));
        assert!(locks.is_locked(3));
    }

    #[tokio::test]
    async fn test_unlock_unknown_is_noop() {
        let locks = manager();
        assert!(!locks.unlock(12345));
    }
}
