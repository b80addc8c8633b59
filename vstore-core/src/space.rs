//! Per-user space accounting
//!
//! Space figures are memoized in process memory and adjusted in place as
//! transactions reserve and release bytes. The cache assumes this process
//! is the only writer of a user's store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use tokio::sync::Mutex;

/// Name of the persisted quota file inside a user folder.
pub const QUOTA_FILE: &str = "quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub free: u64,
    pub used: u64,
}

/// Memoized space figures for every user touched by this process.
pub struct SpaceTracker {
    default_quota: u64,
    cache: Mutex<HashMap<String, SpaceInfo>>,
}

impl SpaceTracker {
    pub fn new(default_quota: u64) -> Self {
        Self {
            default_quota,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn compute(&self, user_dir: &Path) -> Result<SpaceInfo> {
        let quota = read_quota(user_dir).await?.unwrap_or(self.default_quota);
        let used = disk_usage(user_dir).await;
        Ok(SpaceInfo {
            free: quota.saturating_sub(used),
            used,
        })
    }

    /// Current figures for `user`, computing them on first use.
    pub async fn space_info(&self, user: &str, user_dir: &Path) -> Result<SpaceInfo> {
        let mut cache = self.cache.lock().await;
        if let Some(info) = cache.get(user) {
            return Ok(*info);
        }
        let info = self.compute(user_dir).await?;
        cache.insert(user.to_string(), info);
        Ok(info)
    }

    /// Adjusts figures by `delta` bytes; positive deltas must fit in `free`.
    pub async fn reserve(&self, user: &str, user_dir: &Path, delta: i64) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let info = match cache.entry(user.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.compute(user_dir).await?),
        };
        let amount = delta.unsigned_abs();
        if delta > 0 {
            if amount > info.free {
                return Err(StoreError::NotEnoughSpace {
                    requested: amount,
                    free: info.free,
                });
            }
            info.free -= amount;
            info.used += amount;
        } else {
            info.free += amount;
            info.used = info.used.saturating_sub(amount);
        }
        tracing::debug!(user, delta, free = info.free, "space reserved");
        Ok(())
    }

    /// Forgets the figures for `user`; the next use recomputes them.
    pub async fn reset(&self, user: &str) {
        self.cache.lock().await.remove(user);
    }
}

/// Reads the persisted quota, `None` when the user has none.
pub async fn read_quota(user_dir: &Path) -> Result<Option<u64>> {
    match tokio::fs::read(user_dir.join(QUOTA_FILE)).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persists a quota for the user owning `user_dir`.
pub async fn write_quota(user_dir: &Path, quota: u64) -> Result<()> {
    tokio::fs::create_dir_all(user_dir).await?;
    tokio::fs::write(user_dir.join(QUOTA_FILE), serde_json::to_vec(&quota)?).await?;
    Ok(())
}

/// Bytes the user currently occupies on disk.
///
/// Not measured yet: always 0, so `free` starts at the full quota and only
/// reservations made by this process count against it.
async fn disk_usage(_user_dir: &Path) -> u64 {
    0
}
