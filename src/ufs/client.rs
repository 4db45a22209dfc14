//! Under-store access.
//!
//! The under store is the durable system of record behind the cache. Workers
//! only ever read ranges from it; failures surface as `Unavailable` so
//! callers know a retry may help, unlike local store errors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{Result, StoreError};

/// Status of a file in the under store.
#[derive(Debug, Clone)]
pub struct UfsFileStatus {
    pub path: String,
    pub length: u64,
}

/// Read-only range access to the under store.
#[async_trait]
pub trait UnderStoreClient: Send + Sync + 'static {
    async fn stat(&self, path: &str) -> Result<UfsFileStatus>;

    /// Open a reader over `[offset, offset + length)` of the file.
    async fn open_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Local-filesystem under store rooted at a directory. Paths are interpreted
/// relative to the root.
pub struct LocalUnderStore {
    root: PathBuf,
}

impl LocalUnderStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path.trim_start_matches('/')))
    }
}

#[async_trait]
impl UnderStoreClient for LocalUnderStore {
    async fn stat(&self, path: &str) -> Result<UfsFileStatus> {
        let resolved = self.resolve(path);
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| StoreError::Unavailable(format!("stat {path}: {e}")))?;
        Ok(UfsFileStatus {
            path: path.to_string(),
            length: meta.len(),
        })
    }

    async fn open_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let resolved = self.resolve(path);
        let mut file = File::open(&resolved)
            .await
            .map_err(|e| StoreError::Unavailable(format!("open {path}: {e}")))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| StoreError::Unavailable(format!("seek {path}@{offset}: {e}")))?;
        }
        Ok(Box::new(file.take(length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stat_and_ranged_read() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("data.bin"), b"hello world")
            .await
            .unwrap();
        let ufs = LocalUnderStore::new(tmp.path());

        let status = ufs.stat("data.bin").await.unwrap();
        assert_eq!(status.length, 11);

        let mut reader = ufs.open_range("data.bin", 6, 5).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"world");
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let ufs = LocalUnderStore::new(tmp.path());
        assert!(matches!(
            ufs.stat("nope.bin").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
