//! Registry of open per-user stores

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::space::SpaceTracker;
use crate::store::{is_plain_name, Store};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opens each user's store once and hands out shared handles.
///
/// All stores share one [`SpaceTracker`], so quota figures stay consistent
/// no matter which handle reserves space.
pub struct StoreRegistry {
    root: PathBuf,
    layout_cache_size: usize,
    space: Arc<SpaceTracker>,
    stores: Mutex<HashMap<String, Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            root: config.root.clone(),
            layout_cache_size: config.layout_cache_size,
            space: Arc::new(SpaceTracker::new(config.default_quota)),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn space(&self) -> &Arc<SpaceTracker> {
        &self.space
    }

    /// The store of `user`, opening (and creating) it on first use.
    pub async fn store(&self, user: &str) -> Result<Arc<Store>> {
        if !is_plain_name(user) {
            return Err(StoreError::InvalidRequest(format!("Invalid user name: {:?}", user)));
        }
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(user) {
            return Ok(store.clone());
        }
        let store = Arc::new(
            Store::open(
                user,
                &self.root.join(user),
                self.space.clone(),
                self.layout_cache_size,
            )
            .await?,
        );
        stores.insert(user.to_string(), store.clone());
        tracing::info!("Registered store for user {}", user);
        Ok(store)
    }

    /// Users with an open store.
    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.stores.lock().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Drops the registry's handle on `user`'s store.
    pub async fn close(&self, user: &str) -> bool {
        let removed = self.stores.lock().await.remove(user).is_some();
        if removed {
            self.space.reset(user).await;
        }
        removed
    }
}
