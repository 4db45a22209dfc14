//! Space allocation and eviction policy.
//!
//! `allocate` selects a directory with enough free space for a new block,
//! honoring the caller's placement hint and scanning tiers fastest first.
//! When nothing fits, it plans an eviction: victims are chosen by the
//! swappable `EvictionPolicy` (LRU by default), skipping pinned and locked
//! blocks. A plan that cannot free enough bytes surfaces as a typed
//! out-of-space condition for the caller, not a generic I/O failure, and is
//! never auto-retried here.

use tracing::debug;

use crate::config::EvictionConfig;
use crate::store::location::{BlockLocation, DirId};
use crate::store::meta::BlockId;
use crate::store::meta_manager::BlockMetadataManager;

/// An eviction candidate with the data the policy ranks on.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub dir: DirId,
    pub size: u64,
    pub last_access_ms: u64,
}

/// Orders eviction candidates, most evictable first.
pub trait EvictionPolicy: Send + Sync {
    fn rank(&self, candidates: &mut [EvictionCandidate]);
}

/// Least-recently-used ordering. Ties break toward the smaller block id so
/// victim selection is deterministic.
pub struct LruEvictor;

impl EvictionPolicy for LruEvictor {
    fn rank(&self, candidates: &mut [EvictionCandidate]) {
        candidates.sort_by_key(|c| (c.last_access_ms, c.block_id));
    }
}

/// Outcome of an allocation attempt.
#[derive(Debug)]
pub enum Allocation {
    /// A directory with enough free space as-is.
    Fit(DirId),
    /// A directory that fits once these victims are evicted.
    Evict {
        dir: DirId,
        victims: Vec<EvictionCandidate>,
    },
    /// No admissible directory can satisfy the request, even with eviction.
    Exhausted,
}

pub struct SpaceAllocator {
    policy: Box<dyn EvictionPolicy>,
}

impl SpaceAllocator {
    pub fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self { policy }
    }

    /// Build the configured policy. Unknown names fall back to LRU.
    pub fn from_config(cfg: &EvictionConfig) -> Self {
        match cfg.policy.as_str() {
            "lru" => Self::new(Box::new(LruEvictor)),
            other => {
                tracing::warn!(policy = other, "Unknown eviction policy, using lru");
                Self::new(Box::new(LruEvictor))
            }
        }
    }

    /// Find a directory that already has `size` free bytes, honoring `hint`.
    pub fn find_fit(
        &self,
        meta: &BlockMetadataManager,
        size: u64,
        hint: BlockLocation,
    ) -> Option<DirId> {
        for tier in &meta.catalog().tiers {
            for dir in &tier.dirs {
                if dir.online && hint.admits(tier.ordinal, tier.medium) && dir.available() >= size {
                    return Some(dir.id);
                }
            }
        }
        None
    }

    /// Find space for `size` bytes, planning an eviction if no directory has
    /// enough free space. `is_locked` filters out blocks with outstanding
    /// read or write locks.
    pub fn allocate(
        &self,
        meta: &BlockMetadataManager,
        size: u64,
        hint: BlockLocation,
        is_locked: &dyn Fn(BlockId) -> bool,
    ) -> Allocation {
        if let Some(dir) = self.find_fit(meta, size, hint) {
            return Allocation::Fit(dir);
        }

        for tier in &meta.catalog().tiers {
            for dir in &tier.dirs {
                if !dir.online
                    || !hint.admits(tier.ordinal, tier.medium)
                    || dir.capacity < size
                {
                    continue;
                }
                if let Some(victims) = self.plan_eviction(meta, dir.id, size, is_locked) {
                    return Allocation::Evict {
                        dir: dir.id,
                        victims,
                    };
                }
            }
        }

        Allocation::Exhausted
    }

    /// Plan enough evictions in `dir` to free `size` bytes, or None if the
    /// evictable blocks cannot cover the shortfall.
    pub fn plan_eviction(
        &self,
        meta: &BlockMetadataManager,
        dir: DirId,
        size: u64,
        is_locked: &dyn Fn(BlockId) -> bool,
    ) -> Option<Vec<EvictionCandidate>> {
        let available = meta.catalog().dir(dir)?.available();
        let shortfall = size.saturating_sub(available);

        let mut candidates: Vec<EvictionCandidate> = meta
            .committed_in_dir(dir)
            .into_iter()
            .filter(|c| !meta.is_pinned(c.block_id) && !is_locked(c.block_id))
            .map(|c| EvictionCandidate {
                block_id: c.block_id,
                dir,
                size: c.size,
                last_access_ms: c.last_access_ms(),
            })
            .collect();
        self.policy.rank(&mut candidates);

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in candidates {
            if freed >= shortfall {
                break;
            }
            freed += candidate.size;
            victims.push(candidate);
        }

        if freed >= shortfall {
            debug!(
                dir = %dir,
                victims = victims.len(),
                freed,
                shortfall,
                "Planned eviction"
            );
            Some(victims)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(block_id: BlockId, last_access_ms: u64) -> EvictionCandidate {
        EvictionCandidate {
            block_id,
            dir: DirId { tier: 0, dir: 0 },
            size: 100,
            last_access_ms,
        }
    }

    #[test]
    fn test_lru_ranks_oldest_first() {
        let mut candidates = vec![candidate(1, 300), candidate(2, 100), candidate(3, 200)];
        LruEvictor.rank(&mut candidates);
        let order: Vec<BlockId> = candidates.iter().map(|c| c.block_id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_lru_tie_breaks_on_block_id() {
        let mut candidates = vec![candidate(9, 100), candidate(4, 100)];
        LruEvictor.rank(&mut candidates);
        assert_eq!(candidates[0].block_id, 4);
    }
}
