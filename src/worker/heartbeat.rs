//! Heartbeat synchronization with the coordinator.
//!
//! A `HeartbeatReporter` subscribes to store events and accumulates the
//! delta since the last acknowledged report. `HeartbeatSync` drains it each
//! cycle and sends it with a usage snapshot; on failure the delta is merged
//! back so no inventory change is ever silently dropped. A coordinator that
//! answers `UnknownWorker` triggers re-registration with a full snapshot,
//! which subsumes any pending delta.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::error::{Result, StoreError};
use crate::store::meta::{new_session_id, BlockId};
use crate::store::store::{BlockStoreEventListener, TieredBlockStore};
use crate::worker::coordinator::{
    CoordinatorClient, HeartbeatReport, HeartbeatResponse, WorkerCommand, WorkerRegistration,
};

#[derive(Default)]
struct Pending {
    added: HashMap<BlockId, String>,
    removed: HashSet<BlockId>,
}

/// Accumulates inventory changes between heartbeats.
#[derive(Default)]
pub struct HeartbeatReporter {
    pending: Mutex<Pending>,
}

impl HeartbeatReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the pending delta for transmission.
    pub fn take(&self) -> HeartbeatReport {
        let mut pending = self.pending.lock().expect("heartbeat delta poisoned");
        HeartbeatReport {
            added: pending.added.drain().collect(),
            removed: pending.removed.drain().collect(),
        }
    }

    /// Return an unsent report to the pending delta. Changes recorded since
    /// the failed send take precedence.
    pub fn merge_back(&self, report: HeartbeatReport) {
        let mut pending = self.pending.lock().expect("heartbeat delta poisoned");
        for (block_id, alias) in report.added {
            if !pending.removed.contains(&block_id) {
                pending.added.entry(block_id).or_insert(alias);
            }
        }
        for block_id in report.removed {
            if !pending.added.contains_key(&block_id) {
                pending.removed.insert(block_id);
            }
        }
    }

    fn record_removed(&self, block_id: BlockId) {
        let mut pending = self.pending.lock().expect("heartbeat delta poisoned");
        pending.added.remove(&block_id);
        pending.removed.insert(block_id);
    }
}

impl BlockStoreEventListener for HeartbeatReporter {
    fn on_commit(&self, block_id: BlockId, tier_alias: &str) {
        let mut pending = self.pending.lock().expect("heartbeat delta poisoned");
        pending.removed.remove(&block_id);
        pending.added.insert(block_id, tier_alias.to_string());
    }

    fn on_remove(&self, block_id: BlockId) {
        self.record_removed(block_id);
    }

    fn on_evict(&self, block_id: BlockId) {
        self.record_removed(block_id);
    }

    fn on_block_lost(&self, block_id: BlockId) {
        self.record_removed(block_id);
    }
}

/// Periodic heartbeat loop. Cycles never overlap; a cycle that exhausts its
/// retry budget merges its delta back and yields to the next tick.
pub struct HeartbeatSync {
    store: TieredBlockStore,
    coordinator: Arc<dyn CoordinatorClient>,
    reporter: Arc<HeartbeatReporter>,
    worker_id: Arc<AtomicU64>,
    address: String,
    cfg: HeartbeatConfig,
}

impl HeartbeatSync {
    pub fn new(
        store: TieredBlockStore,
        coordinator: Arc<dyn CoordinatorClient>,
        reporter: Arc<HeartbeatReporter>,
        worker_id: Arc<AtomicU64>,
        address: String,
        cfg: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            reporter,
            worker_id,
            address,
            cfg,
        }
    }

    /// Register with the coordinator, retrying with backoff until the
    /// registration budget runs out. Fatal to worker startup on failure.
    pub async fn acquire_worker_id(&self) -> Result<u64> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.registration_timeout_ms);
        let mut backoff = Duration::from_millis(self.cfg.backoff_base_ms);
        loop {
            match self.register().await {
                Ok(worker_id) => {
                    info!(worker_id, "Acquired worker identity");
                    return Ok(worker_id);
                }
                Err(e) if e.is_retryable() && Instant::now() + backoff < deadline => {
                    debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "Registration failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(self.cfg.backoff_max_ms));
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "could not register with coordinator: {e}"
                    )))
                }
            }
        }
    }

    async fn register(&self) -> Result<u64> {
        let registration = WorkerRegistration {
            address: self.address.clone(),
            usage: self.store.store_meta().await,
            blocks: self.store.committed_blocks().await,
        };
        let worker_id = self.coordinator.register_worker(registration).await?;
        self.worker_id.store(worker_id, Ordering::Relaxed);
        Ok(worker_id)
    }

    /// Drive heartbeats forever. Spawn as a background task.
    pub async fn run(self) {
        let mut ticker = interval(Duration::from_millis(self.cfg.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.beat_once().await;
        }
    }

    /// One heartbeat cycle: drain the delta, send with retries, execute any
    /// returned commands. A retry re-drains the delta so changes recorded
    /// during the outage ride the retried send instead of the next cycle.
    pub async fn beat_once(&self) {
        let mut report = self.reporter.take();
        let deadline = Instant::now() + Duration::from_millis(self.cfg.retry_timeout_ms);
        let mut backoff = Duration::from_millis(self.cfg.backoff_base_ms);

        loop {
            let worker_id = self.worker_id.load(Ordering::Relaxed);
            let usage = self.store.store_meta().await;
            match self
                .coordinator
                .heartbeat(worker_id, usage, report.clone())
                .await
            {
                Ok(HeartbeatResponse::Ack { commands }) => {
                    self.execute(commands).await;
                    return;
                }
                Ok(HeartbeatResponse::UnknownWorker) => {
                    warn!(worker_id, "Coordinator no longer recognizes this worker, re-registering");
                    match self.register().await {
                        // Registration carried the full inventory, which
                        // subsumes the pending delta.
                        Ok(_) => return,
                        Err(e) => {
                            if Instant::now() + backoff >= deadline {
                                warn!(error = %e, "Re-registration failed, deferring to next cycle");
                                self.reporter.merge_back(report);
                                return;
                            }
                            sleep(backoff).await;
                            backoff = (backoff * 2)
                                .min(Duration::from_millis(self.cfg.backoff_max_ms));
                            report = self.refreshed(report);
                        }
                    }
                }
                Err(e) if e.is_retryable() && Instant::now() + backoff < deadline => {
                    debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "Heartbeat failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(self.cfg.backoff_max_ms));
                    report = self.refreshed(report);
                }
                Err(e) => {
                    warn!(error = %e, "Heartbeat cycle failed, merging delta back");
                    self.reporter.merge_back(report);
                    return;
                }
            }
        }
    }

    /// Fold an unsent report together with whatever accumulated since it was
    /// drained, yielding the union for the next attempt.
    fn refreshed(&self, unsent: HeartbeatReport) -> HeartbeatReport {
        self.reporter.merge_back(unsent);
        self.reporter.take()
    }

    async fn execute(&self, commands: Vec<WorkerCommand>) {
        for command in commands {
            match command {
                WorkerCommand::FreeBlock(block_id) => {
                    let session_id = new_session_id();
                    match self.store.remove_block(session_id, block_id).await {
                        Ok(()) => info!(block_id, "Freed block at coordinator request"),
                        Err(e) => {
                            warn!(block_id, error = %e, "Could not free block, coordinator will retry")
                        }
                    }
                }
                WorkerCommand::UpdatePinnedBlocks(ids) => {
                    debug!(pinned = ids.len(), "Updating pin list");
                    self.store.update_pinned_blocks(ids).await;
                }
            }
        }
    }
}
