//! Coordinator protocol surface.
//!
//! The worker reports its inventory to a coordinator: a full snapshot at
//! registration, then per-cycle deltas over the heartbeat. The coordinator
//! answers with commands (free a block, replace the pin list) and may
//! disown a worker it no longer recognizes, which forces re-registration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::meta::{BlockId, StoreMeta};

/// Inventory changes since the last acknowledged heartbeat.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    /// Blocks committed, with the tier alias they landed on.
    pub added: Vec<(BlockId, String)>,
    /// Blocks removed, evicted or lost.
    pub removed: Vec<BlockId>,
}

impl HeartbeatReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Instructions piggybacked on a heartbeat acknowledgement.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Evict the block at the coordinator's request.
    FreeBlock(BlockId),
    /// Replace the set of blocks exempt from eviction.
    UpdatePinnedBlocks(HashSet<BlockId>),
}

#[derive(Debug, Clone)]
pub enum HeartbeatResponse {
    Ack { commands: Vec<WorkerCommand> },
    /// The coordinator does not recognize this worker id; re-register with
    /// a full inventory snapshot.
    UnknownWorker,
}

/// What a worker presents when registering.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub address: String,
    pub usage: StoreMeta,
    /// Full inventory: every committed block with its tier alias.
    pub blocks: Vec<(BlockId, String)>,
}

#[async_trait]
pub trait CoordinatorClient: Send + Sync + 'static {
    /// Register and obtain a worker id.
    async fn register_worker(&self, registration: WorkerRegistration) -> Result<u64>;

    async fn heartbeat(
        &self,
        worker_id: u64,
        usage: StoreMeta,
        report: HeartbeatReport,
    ) -> Result<HeartbeatResponse>;

    /// Synchronously record a commit so the block is immediately locatable
    /// by other clients.
    async fn commit_block(
        &self,
        worker_id: u64,
        block_id: BlockId,
        tier_alias: &str,
        size: u64,
    ) -> Result<()>;
}

#[derive(Default)]
struct CoordinatorState {
    /// Block id -> (tier alias, size) as last reported.
    blocks: HashMap<BlockId, (String, u64)>,
    /// Commands queued for the next heartbeat.
    pending_commands: Vec<WorkerCommand>,
    /// Heartbeats left to fail with `Unavailable` (test hook).
    fail_heartbeats: u32,
    /// Whether the next heartbeat is answered with `UnknownWorker`.
    disown_next: bool,
}

/// In-process coordinator used for standalone deployments and tests. Tracks
/// one worker's inventory; registration simply mints a fresh id.
#[derive(Default)]
pub struct StandaloneCoordinator {
    next_worker_id: AtomicU64,
    state: Mutex<CoordinatorState>,
}

impl StandaloneCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command for delivery on the next heartbeat.
    pub fn queue_command(&self, command: WorkerCommand) {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .pending_commands
            .push(command);
    }

    /// Make the next `n` heartbeats fail as unavailable.
    pub fn fail_next_heartbeats(&self, n: u32) {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .fail_heartbeats = n;
    }

    /// Answer the next heartbeat with `UnknownWorker`.
    pub fn disown_worker(&self) {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .disown_next = true;
    }

    /// Block ids the coordinator currently believes the worker holds.
    pub fn known_blocks(&self) -> HashSet<BlockId> {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .blocks
            .keys()
            .copied()
            .collect()
    }

    pub fn registrations(&self) -> u64 {
        self.next_worker_id.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CoordinatorClient for StandaloneCoordinator {
    async fn register_worker(&self, registration: WorkerRegistration) -> Result<u64> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock().expect("coordinator state poisoned");
        state.blocks = registration
            .blocks
            .into_iter()
            .map(|(id, alias)| (id, (alias, 0)))
            .collect();
        debug!(worker_id, address = %registration.address, "Registered worker");
        Ok(worker_id)
    }

    async fn heartbeat(
        &self,
        _worker_id: u64,
        _usage: StoreMeta,
        report: HeartbeatReport,
    ) -> Result<HeartbeatResponse> {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        if state.fail_heartbeats > 0 {
            state.fail_heartbeats -= 1;
            return Err(StoreError::Unavailable("coordinator unreachable".into()));
        }
        if state.disown_next {
            state.disown_next = false;
            return Ok(HeartbeatResponse::UnknownWorker);
        }
        for (block_id, alias) in report.added {
            state.blocks.insert(block_id, (alias, 0));
        }
        for block_id in report.removed {
            state.blocks.remove(&block_id);
        }
        Ok(HeartbeatResponse::Ack {
            commands: std::mem::take(&mut state.pending_commands),
        })
    }

    async fn commit_block(
        &self,
        _worker_id: u64,
        block_id: BlockId,
        tier_alias: &str,
        size: u64,
    ) -> Result<()> {
        self.state
            .lock()
            .expect("coordinator state poisoned")
            .blocks
            .insert(block_id, (tier_alias.to_string(), size));
        Ok(())
    }
}
