//! Store configuration
//!
//! Loaded from a TOML file; every key has a default so a missing file or a
//! partial one still yields a usable configuration.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one `<user>/store/` tree per user.
    pub root: PathBuf,
    /// Quota for users without a persisted one, in bytes.
    pub default_quota: u64,
    /// Age after which a transaction may be cancelled without its id.
    pub stale_transaction_secs: u64,
    /// Parsed version layouts cached per store.
    pub layout_cache_size: usize,
    /// Default log filter for binaries.
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/users"),
            default_quota: 10 * 1024 * 1024 * 1024, // 10 GiB
            stale_transaction_secs: 3600,
            layout_cache_size: 256,
            log_level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    /// Reads a TOML config file; a missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| StoreError::InvalidRequest(format!("Invalid config: {}", e)))
    }

    pub fn stale_transaction_age(&self) -> Duration {
        Duration::from_secs(self.stale_transaction_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = StoreConfig::from_toml(
            r#"
            root = "/srv/vstore"
            default_quota = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/vstore"));
        assert_eq!(config.default_quota, 1_048_576);
        assert_eq!(config.stale_transaction_secs, 3600);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_rejects_bad_types() {
        assert!(StoreConfig::from_toml("default_quota = \"lots\"").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::load(&dir.path().join("vstore.toml")).await.unwrap();
        assert_eq!(config, StoreConfig::default());
    }
}
