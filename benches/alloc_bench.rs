//! Benchmarks for the allocation hot path: directory fitting, LRU ranking,
//! and eviction planning over a populated catalog.

use blockworker::config::{DirSpec, EvictionConfig, TierSpec, TiersConfig};
use blockworker::store::alloc::{EvictionCandidate, EvictionPolicy, LruEvictor, SpaceAllocator};
use blockworker::store::location::{BlockLocation, DirId, Medium};
use blockworker::store::meta_manager::BlockMetadataManager;
use blockworker::store::tier::TierCatalog;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

const DIR: DirId = DirId { tier: 0, dir: 0 };
const BLOCK_SIZE: u64 = 1024;

fn populated_manager(blocks: u64, spare: u64) -> (TempDir, BlockMetadataManager) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let cfg = TiersConfig {
        tiers: vec![TierSpec {
            alias: "MEM".to_string(),
            medium: Medium::Mem,
            dirs: vec![DirSpec {
                path: tmp.path().join("mem"),
                capacity_bytes: blocks * BLOCK_SIZE + spare,
            }],
        }],
    };
    let catalog = rt.block_on(TierCatalog::open(&cfg)).unwrap();
    let mut manager = BlockMetadataManager::new(catalog);
    for block_id in 0..blocks {
        manager.add_temp(1, block_id, DIR, BLOCK_SIZE).unwrap();
        manager.commit(block_id, 1, BLOCK_SIZE).unwrap();
    }
    (tmp, manager)
}

fn bench_lru_rank(c: &mut Criterion) {
    let candidates: Vec<EvictionCandidate> = (0..10_000u64)
        .map(|block_id| EvictionCandidate {
            block_id,
            dir: DIR,
            size: BLOCK_SIZE,
            // Pseudo-shuffled access times.
            last_access_ms: block_id.wrapping_mul(2654435761) % 100_000,
        })
        .collect();

    c.bench_function("lru_rank_10k", |b| {
        b.iter(|| {
            let mut batch = candidates.clone();
            LruEvictor.rank(black_box(&mut batch));
            batch
        })
    });
}

fn bench_find_fit(c: &mut Criterion) {
    let (_tmp, manager) = populated_manager(10_000, 4 * BLOCK_SIZE);
    let allocator = SpaceAllocator::from_config(&EvictionConfig::default());

    c.bench_function("find_fit_10k_blocks", |b| {
        b.iter(|| allocator.find_fit(black_box(&manager), BLOCK_SIZE, BlockLocation::AnyTier))
    });
}

fn bench_plan_eviction(c: &mut Criterion) {
    // Full directory: every allocation must plan an eviction.
    let (_tmp, manager) = populated_manager(10_000, 0);
    let allocator = SpaceAllocator::from_config(&EvictionConfig::default());
    let unlocked = |_: u64| false;

    c.bench_function("plan_eviction_64_of_10k", |b| {
        b.iter(|| {
            allocator.plan_eviction(
                black_box(&manager),
                DIR,
                64 * BLOCK_SIZE,
                &unlocked,
            )
        })
    });
}

criterion_group!(benches, bench_lru_rank, bench_find_fit, bench_plan_eviction);
criterion_main!(benches);
