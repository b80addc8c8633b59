//! Exclusive write leases backed by directories
//!
//! A lease is a directory: creating it is atomic, so at most one writer can
//! hold an object's lease at a time, and because it lives on disk it
//! survives process restarts. The directory also holds the transaction
//! record and the version file under construction.

use crate::error::Result;
use crate::transaction::TransactionRecord;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const RECORD_FILE: &str = "transaction";
const VERSION_FILE: &str = "new";

#[derive(Debug, Clone)]
pub struct DirLease {
    dir: PathBuf,
}

impl DirLease {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File receiving the new version's bytes.
    pub fn version_file(&self) -> PathBuf {
        self.dir.join(VERSION_FILE)
    }

    /// Takes the lease. `Ok(false)` means another writer holds it.
    pub async fn acquire(&self) -> Result<bool> {
        match tokio::fs::create_dir(&self.dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the lease and everything in it. Releasing a free lease is a no-op.
    pub async fn release(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_held(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.dir).await?)
    }

    /// Time since the lease was last touched.
    pub async fn age(&self) -> Result<Duration> {
        let modified = tokio::fs::metadata(&self.dir).await?.modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO))
    }

    /// The record of the held lease, `None` when none was written yet.
    pub async fn read_record(&self) -> Result<Option<TransactionRecord>> {
        match tokio::fs::read(self.dir.join(RECORD_FILE)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_record(&self, record: &TransactionRecord) -> Result<()> {
        let path = self.dir.join(RECORD_FILE);
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec(record)?).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let lease = DirLease::new(tmp.path().join("obj"));
        assert!(lease.acquire().await.unwrap());
        assert!(!lease.acquire().await.unwrap());
        assert!(lease.is_held().await.unwrap());

        lease.release().await.unwrap();
        assert!(!lease.is_held().await.unwrap());
        lease.release().await.unwrap();
        assert!(lease.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_survives_new_handle() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("obj");
        assert!(DirLease::new(dir.clone()).acquire().await.unwrap());
        assert!(!DirLease::new(dir).acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let lease = DirLease::new(tmp.path().join("obj"));
        lease.acquire().await.unwrap();
        assert_eq!(lease.read_record().await.unwrap(), None);
        assert!(lease.age().await.unwrap() < Duration::from_secs(60));
    }
}
