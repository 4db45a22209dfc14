//! Tier catalog: the static layout of storage tiers and the dynamic
//! bookkeeping of each directory's capacity and residents.
//!
//! Used/free byte counters are mutated only under the metadata manager's
//! exclusive lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::info;

use crate::config::TiersConfig;
use crate::error::Result;
use crate::store::location::{DirId, Medium};
use crate::store::meta::BlockId;

/// One storage directory and its bookkeeping state.
#[derive(Debug)]
pub struct StorageDir {
    pub id: DirId,
    pub path: PathBuf,
    pub capacity: u64,
    /// Reserved temp bytes plus committed bytes. Never exceeds `capacity`.
    pub used: u64,
    /// Committed blocks resident here.
    pub committed: HashSet<BlockId>,
    /// Temp blocks reserved here.
    pub temp: HashSet<BlockId>,
    /// A directory that fails its liveness probe is taken offline and its
    /// residents dropped from the catalog.
    pub online: bool,
}

impl StorageDir {
    /// Free bytes available for new reservations.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Path of a committed block file in this directory.
    pub fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.path.join(format!("{block_id}.block"))
    }

    /// Path of a temp block file in this directory.
    pub fn temp_path(&self, block_id: BlockId) -> PathBuf {
        self.path.join(format!("{block_id}.tmp"))
    }

    pub(crate) fn reserve(&mut self, bytes: u64) {
        self.used += bytes;
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// One tier: an alias, a medium, and its directories.
#[derive(Debug)]
pub struct TierMeta {
    pub ordinal: usize,
    pub alias: String,
    pub medium: Medium,
    pub dirs: Vec<StorageDir>,
}

/// The full tier layout, fastest tier first.
#[derive(Debug)]
pub struct TierCatalog {
    pub tiers: Vec<TierMeta>,
}

impl TierCatalog {
    /// Build the catalog from configuration, creating each directory.
    pub async fn open(cfg: &TiersConfig) -> Result<Self> {
        let mut tiers = Vec::with_capacity(cfg.tiers.len());
        for (ordinal, tier) in cfg.tiers.iter().enumerate() {
            let mut dirs = Vec::with_capacity(tier.dirs.len());
            for (index, dir) in tier.dirs.iter().enumerate() {
                fs::create_dir_all(&dir.path).await?;
                dirs.push(StorageDir {
                    id: DirId {
                        tier: ordinal,
                        dir: index,
                    },
                    path: dir.path.clone(),
                    capacity: dir.capacity_bytes,
                    used: 0,
                    committed: HashSet::new(),
                    temp: HashSet::new(),
                    online: true,
                });
            }
            info!(
                tier = ordinal,
                alias = %tier.alias,
                dirs = dirs.len(),
                capacity = dirs.iter().map(|d| d.capacity).sum::<u64>(),
                "Opened storage tier"
            );
            tiers.push(TierMeta {
                ordinal,
                alias: tier.alias.clone(),
                medium: tier.medium,
                dirs,
            });
        }
        Ok(Self { tiers })
    }

    pub fn dir(&self, id: DirId) -> Option<&StorageDir> {
        self.tiers.get(id.tier)?.dirs.get(id.dir)
    }

    pub fn dir_mut(&mut self, id: DirId) -> Option<&mut StorageDir> {
        self.tiers.get_mut(id.tier)?.dirs.get_mut(id.dir)
    }

    /// Tier alias for a tier ordinal. Unknown ordinals map to "UNKNOWN"
    /// rather than panicking in reporting paths.
    pub fn alias(&self, tier: usize) -> &str {
        self.tiers
            .get(tier)
            .map(|t| t.alias.as_str())
            .unwrap_or("UNKNOWN")
    }

    /// All online directories, fastest tier first.
    pub fn online_dirs(&self) -> impl Iterator<Item = &StorageDir> {
        self.tiers
            .iter()
            .flat_map(|t| t.dirs.iter())
            .filter(|d| d.online)
    }

    /// Probe one directory for liveness: write and remove a marker file.
    pub async fn probe(path: &Path) -> std::io::Result<()> {
        let marker = path.join(".health");
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirSpec, TierSpec};
    use tempfile::TempDir;

    fn one_tier_config(path: PathBuf, capacity: u64) -> TiersConfig {
        TiersConfig {
            tiers: vec![TierSpec {
                alias: "MEM".to_string(),
                medium: Medium::Mem,
                dirs: vec![DirSpec {
                    path,
                    capacity_bytes: capacity,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_open_creates_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mem");
        let catalog = TierCatalog::open(&one_tier_config(path.clone(), 4096))
            .await
            .unwrap();
        assert!(path.exists());
        let dir = catalog.dir(DirId { tier: 0, dir: 0 }).unwrap();
        assert_eq!(dir.capacity, 4096);
        assert_eq!(dir.available(), 4096);
    }

    #[tokio::test]
    async fn test_probe_detects_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good");
        tokio::fs::create_dir_all(&good).await.unwrap();
        assert!(TierCatalog::probe(&good).await.is_ok());
        assert!(TierCatalog::probe(&tmp.path().join("missing")).await.is_err());
    }
}
