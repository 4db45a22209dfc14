//! Error taxonomy for the block worker.
//!
//! Lifecycle APIs return typed errors so the RPC collaborator can map them to
//! its own status surface. `Unavailable` is the only retryable kind; an
//! `OutOfSpace` from the allocator is deliberately not retried at this layer.

use thiserror::Error;

use crate::store::location::BlockLocation;
use crate::store::lock::LockMode;
use crate::store::meta::{BlockId, SessionId};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("block {0} already exists")]
    BlockAlreadyExists(BlockId),

    #[error("block {0} is already committed")]
    BlockAlreadyCommitted(BlockId),

    #[error("out of space: requested {requested} bytes at {location}")]
    OutOfSpace {
        requested: u64,
        location: BlockLocation,
    },

    #[error("block {0} is in use")]
    BlockInUse(BlockId),

    #[error("timed out waiting for a {mode} lock on block {block_id}")]
    LockTimeout { block_id: BlockId, mode: LockMode },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation. Should never occur; indicates a bug.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(StoreError::Unavailable("coordinator down".into()).is_retryable());
        assert!(!StoreError::OutOfSpace {
            requested: 1024,
            location: BlockLocation::AnyTier,
        }
        .is_retryable());
        assert!(!StoreError::BlockNotFound(7).is_retryable());
    }
}
