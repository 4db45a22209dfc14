//! Prometheus metrics for the worker, fed by store events and served on the
//! admin endpoint.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::store::meta::BlockId;
use crate::store::store::BlockStoreEventListener;

pub struct WorkerMetrics {
    registry: Registry,
    pub blocks_committed: IntCounter,
    pub blocks_evicted: IntCounter,
    pub blocks_removed: IntCounter,
    pub blocks_lost: IntCounter,
    pub blocks_aborted: IntCounter,
    /// Clients with an active session on this worker.
    pub active_clients: IntGauge,
    pub used_bytes: IntGauge,
    pub capacity_bytes: IntGauge,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let blocks_committed =
            IntCounter::new("worker_blocks_committed_total", "Blocks committed").unwrap();
        let blocks_evicted =
            IntCounter::new("worker_blocks_evicted_total", "Blocks evicted").unwrap();
        let blocks_removed =
            IntCounter::new("worker_blocks_removed_total", "Blocks removed by request").unwrap();
        let blocks_lost =
            IntCounter::new("worker_blocks_lost_total", "Blocks lost to failed storage").unwrap();
        let blocks_aborted =
            IntCounter::new("worker_blocks_aborted_total", "Temp blocks aborted").unwrap();
        let active_clients =
            IntGauge::new("worker_active_clients", "Sessions currently active").unwrap();
        let used_bytes = IntGauge::new("worker_used_bytes", "Bytes used across tiers").unwrap();
        let capacity_bytes =
            IntGauge::new("worker_capacity_bytes", "Capacity across tiers").unwrap();

        for collector in [
            &blocks_committed,
            &blocks_evicted,
            &blocks_removed,
            &blocks_lost,
            &blocks_aborted,
        ] {
            registry.register(Box::new(collector.clone())).unwrap();
        }
        registry.register(Box::new(active_clients.clone())).unwrap();
        registry.register(Box::new(used_bytes.clone())).unwrap();
        registry.register(Box::new(capacity_bytes.clone())).unwrap();

        Self {
            registry,
            blocks_committed,
            blocks_evicted,
            blocks_removed,
            blocks_lost,
            blocks_aborted,
            active_clients,
            used_bytes,
            capacity_bytes,
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buf)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStoreEventListener for WorkerMetrics {
    fn on_commit(&self, _block_id: BlockId, _tier_alias: &str) {
        self.blocks_committed.inc();
    }

    fn on_abort(&self, _block_id: BlockId) {
        self.blocks_aborted.inc();
    }

    fn on_remove(&self, _block_id: BlockId) {
        self.blocks_removed.inc();
    }

    fn on_evict(&self, _block_id: BlockId) {
        self.blocks_evicted.inc();
    }

    fn on_block_lost(&self, _block_id: BlockId) {
        self.blocks_lost.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_move_counters() {
        let metrics = WorkerMetrics::new();
        metrics.on_commit(1, "MEM");
        metrics.on_evict(1);
        assert_eq!(metrics.blocks_committed.get(), 1);
        assert_eq!(metrics.blocks_evicted.get(), 1);
        assert!(metrics.render().contains("worker_blocks_committed_total"));
    }
}
