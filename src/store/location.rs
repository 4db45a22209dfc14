//! Block placement: media, directory identities, and allocation hints.

use serde::{Deserialize, Serialize};

/// Medium backing a storage directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Medium {
    /// Memory-backed (e.g. ramdisk).
    Mem,
    /// Solid-state disk.
    Ssd,
    /// Spinning disk.
    Hdd,
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Medium::Mem => write!(f, "MEM"),
            Medium::Ssd => write!(f, "SSD"),
            Medium::Hdd => write!(f, "HDD"),
        }
    }
}

/// Identifies one concrete storage directory: tier ordinal (0 = fastest)
/// plus the directory's index within that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirId {
    pub tier: usize,
    pub dir: usize,
}

impl std::fmt::Display for DirId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier {} dir {}", self.tier, self.dir)
    }
}

/// An allocation hint: where a new block may be placed.
///
/// Directories are always scanned fastest tier first unless the hint pins a
/// tier or a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockLocation {
    /// Any directory in any tier.
    AnyTier,
    /// Any directory in the given tier (0 = fastest).
    AnyDirInTier(usize),
    /// Any directory on the given medium, regardless of tier.
    AnyDirWithMedium(Medium),
}

impl BlockLocation {
    /// Whether a directory in `tier` with `medium` satisfies this hint.
    pub fn admits(&self, tier: usize, medium: Medium) -> bool {
        match self {
            BlockLocation::AnyTier => true,
            BlockLocation::AnyDirInTier(t) => *t == tier,
            BlockLocation::AnyDirWithMedium(m) => *m == medium,
        }
    }
}

impl std::fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockLocation::AnyTier => write!(f, "any tier"),
            BlockLocation::AnyDirInTier(t) => write!(f, "tier {t}"),
            BlockLocation::AnyDirWithMedium(m) => write!(f, "medium {m}"),
        }
    }
}
