//! Runtime configuration for blockworker.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (directories, capacities, eviction policy) live here,
//! along with heartbeat, session and cache-population tuning.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::store::location::Medium;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "blockworker", about = "Worker-side tiered block cache node")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Admin HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Storage tier layout.
    pub tiers: TiersConfig,

    /// Eviction policy selection.
    pub eviction: EvictionConfig,

    /// Block lock acquisition tuning.
    pub locks: LockConfig,

    /// Worker to coordinator heartbeat tuning.
    pub heartbeat: HeartbeatConfig,

    /// Cache-population request pool tuning.
    pub cache: CacheConfig,

    /// Session lifetime tuning.
    pub session: SessionConfig,

    /// Under-store access.
    pub ufs: UfsConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// One storage directory within a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirSpec {
    /// Filesystem path holding this directory's block files.
    pub path: PathBuf,

    /// Capacity budget in bytes.
    pub capacity_bytes: u64,
}

/// One storage tier. Tiers are listed fastest first; ordinal 0 is fastest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Tier alias reported to the coordinator (e.g. "MEM", "SSD").
    pub alias: String,

    /// Medium backing this tier.
    pub medium: Medium,

    /// Directories belonging to this tier.
    pub dirs: Vec<DirSpec>,
}

/// Storage tier layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Tiers in speed order, fastest first.
    pub tiers: Vec<TierSpec>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierSpec {
                    alias: "MEM".to_string(),
                    medium: Medium::Mem,
                    dirs: vec![DirSpec {
                        path: PathBuf::from("/tmp/blockworker/mem"),
                        capacity_bytes: 1024 * 1024 * 1024, // 1 GB
                    }],
                },
                TierSpec {
                    alias: "SSD".to_string(),
                    medium: Medium::Ssd,
                    dirs: vec![DirSpec {
                        path: PathBuf::from("/tmp/blockworker/ssd"),
                        capacity_bytes: 20 * 1024 * 1024 * 1024, // 20 GB
                    }],
                },
            ],
        }
    }
}

impl TiersConfig {
    /// Total capacity across all tiers and directories.
    pub fn total_capacity(&self) -> u64 {
        self.tiers
            .iter()
            .flat_map(|t| t.dirs.iter())
            .map(|d| d.capacity_bytes)
            .sum()
    }
}

/// Eviction policy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Policy name. "lru" is the only built-in; custom policies plug in
    /// through the `EvictionPolicy` trait.
    pub policy: String,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: "lru".to_string(),
        }
    }
}

/// Block lock acquisition tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a lock acquisition waits for conflicting locks to clear
    /// before failing with a timeout.
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Worker to coordinator heartbeat tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between delta reports.
    pub interval_ms: u64,

    /// Total time budget for retrying one heartbeat before the delta is
    /// merged back and the cycle skipped.
    pub retry_timeout_ms: u64,

    /// Initial backoff between heartbeat retries.
    pub backoff_base_ms: u64,

    /// Ceiling for the exponential backoff.
    pub backoff_max_ms: u64,

    /// Total time budget for acquiring a worker identity at startup.
    /// Exhausting it is fatal to worker startup.
    pub registration_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            retry_timeout_ms: 10_000,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
            registration_timeout_ms: 60_000,
        }
    }
}

/// Cache-population request pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum concurrent populate operations.
    pub max_concurrent_requests: usize,

    /// Chunk size for streaming under-store ranges into local blocks.
    pub chunk_size_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            chunk_size_bytes: 8 * 1024 * 1024, // 8 MB
        }
    }
}

/// Session lifetime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session with no activity for this long is reaped.
    pub timeout_ms: u64,

    /// How often the reaper sweeps for abandoned sessions.
    pub reaper_interval_ms: u64,

    /// How often each storage directory's liveness is probed.
    pub storage_check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            reaper_interval_ms: 10_000,
            storage_check_interval_ms: 60_000,
        }
    }
}

/// Under-store access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UfsConfig {
    /// Root path for the local-filesystem under store.
    pub root: PathBuf,
}

impl Default for UfsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/blockworker/ufs"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
