//! Background reaper for abandoned sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::config::SessionConfig;
use crate::store::store::TieredBlockStore;
use crate::ufs::bridge::UnderStoreBlockBridge;

/// Sweeps for sessions idle past the timeout and tears down everything they
/// left behind: temp blocks, locks, and open under-store handles.
pub struct SessionReaper {
    store: TieredBlockStore,
    bridge: Arc<UnderStoreBlockBridge>,
    cfg: SessionConfig,
}

impl SessionReaper {
    pub fn new(
        store: TieredBlockStore,
        bridge: Arc<UnderStoreBlockBridge>,
        cfg: SessionConfig,
    ) -> Self {
        Self { store, bridge, cfg }
    }

    /// Drive sweeps forever. Spawn as a background task.
    pub async fn run(self) {
        let mut ticker = interval(Duration::from_millis(self.cfg.reaper_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One sweep: clean up every session idle past the timeout.
    pub async fn sweep_once(&self) {
        let timeout = Duration::from_millis(self.cfg.timeout_ms);
        for session_id in self.store.sessions().expired(timeout) {
            let closed = self.bridge.close_all_for_session(session_id);
            self.store.cleanup_session(session_id).await;
            info!(session_id, ufs_handles = closed, "Reaped idle session");
        }
    }
}
