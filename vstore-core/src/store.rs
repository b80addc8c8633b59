//! Per-user versioned object store
//!
//! Layout on disk:
//! ```text
//! {user}/store/
//!   root/                   status + version files of the root object
//!   root/transaction/       lease of the root object (only while writing)
//!   objects/{objId}/        status + version files of a non-root object
//!   transactions/{objId}/   lease of a non-root object (only while writing)
//!   params/{name}           small JSON parameter files
//! ```
//!
//! A new version is written inside its object's lease folder and becomes
//! visible only when completion renames it into the object folder, so
//! readers never observe a partially written version.

use crate::diff::{self, VersionLayouts};
use crate::error::{Result, StoreError};
use crate::lease::DirLease;
use crate::obj_file::{self, FileLayout};
use crate::reader::{ObjReader, ReadRequest, SegsSource};
use crate::space::{self, SpaceInfo, SpaceTracker};
use crate::status::{self, ObjState, ObjectStatus, Removal};
use crate::transaction::{TransactionParams, TransactionRecord, TransactionType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const ROOT_DIR: &str = "root";
const OBJECTS_DIR: &str = "objects";
const TRANSACTIONS_DIR: &str = "transactions";
const PARAMS_DIR: &str = "params";
const ROOT_LEASE: &str = "transaction";
const ROOT_LABEL: &str = "<root>";

type LayoutKey = (Option<String>, u64);

fn label(obj: Option<&str>) -> String {
    obj.unwrap_or(ROOT_LABEL).to_string()
}

fn check_obj_id(obj: Option<&str>) -> Result<()> {
    match obj {
        None => Ok(()),
        Some(id) if is_plain_name(id) => Ok(()),
        Some(id) => Err(StoreError::InvalidRequest(format!("Invalid object id: {:?}", id))),
    }
}

/// Accepts names that are safe as a single path component.
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Returns the outcome of work done under a lease, logging a failure to
/// release the lease instead of reporting it.
fn keep_outcome<T>(obj: Option<&str>, result: Result<T>, released: Result<()>) -> Result<T> {
    if let Err(e) = released {
        warn!("Failed to release lease of {}: {}", label(obj), e);
    }
    result
}

async fn write_at(path: &Path, pos: u64, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(pos)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

async fn file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// One user's store.
pub struct Store {
    user: String,
    user_dir: PathBuf,
    path: PathBuf,
    space: Arc<SpaceTracker>,
    layouts: Mutex<LruCache<LayoutKey, FileLayout>>,
    /// Makes appends fail halfway through.
    #[cfg(test)]
    fail_appends: std::sync::atomic::AtomicBool,
}

impl Store {
    /// Open or create the store of `user`, kept under `user_dir/store`.
    pub async fn open(
        user: &str,
        user_dir: &Path,
        space: Arc<SpaceTracker>,
        layout_cache_size: usize,
    ) -> Result<Self> {
        let path = user_dir.join("store");
        for dir in [ROOT_DIR, OBJECTS_DIR, TRANSACTIONS_DIR, PARAMS_DIR] {
            tokio::fs::create_dir_all(path.join(dir)).await?;
        }
        let capacity = NonZeroUsize::new(layout_cache_size).unwrap_or(NonZeroUsize::MIN);
        debug!("Opened store of {} at {:?}", user, path);
        Ok(Self {
            user: user.to_string(),
            user_dir: user_dir.to_path_buf(),
            path,
            space,
            layouts: Mutex::new(LruCache::new(capacity)),
            #[cfg(test)]
            fail_appends: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn obj_dir(&self, obj: Option<&str>) -> PathBuf {
        match obj {
            None => self.path.join(ROOT_DIR),
            Some(id) => self.path.join(OBJECTS_DIR).join(id),
        }
    }

    fn lease(&self, obj: Option<&str>) -> DirLease {
        match obj {
            None => DirLease::new(self.path.join(ROOT_DIR).join(ROOT_LEASE)),
            Some(id) => DirLease::new(self.path.join(TRANSACTIONS_DIR).join(id)),
        }
    }

    fn lock_layouts(&self) -> MutexGuard<'_, LruCache<LayoutKey, FileLayout>> {
        self.layouts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget_layouts(&self, obj: Option<&str>) {
        let mut cache = self.lock_layouts();
        let stale: Vec<LayoutKey> = cache
            .iter()
            .filter(|((o, _), _)| o.as_deref() == obj)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    /// Parsed layout of a version file, through the cache.
    async fn layout(&self, obj: Option<&str>, version: u64) -> Result<FileLayout> {
        let key = (obj.map(str::to_string), version);
        let cached = self.lock_layouts().get(&key).cloned();
        if let Some(layout) = cached {
            return Ok(layout);
        }
        let path = self.obj_dir(obj).join(obj_file::version_file_name(version));
        let layout = match obj_file::parse(&path).await {
            Ok(layout) => layout,
            Err(e) if e.is_not_found() => {
                return Err(StoreError::ObjVerUnknown { obj: label(obj), version });
            }
            Err(e) => return Err(e),
        };
        self.lock_layouts().put(key, layout.clone());
        Ok(layout)
    }

    // ==================== Space ====================

    async fn reserve(&self, bytes: u64) -> Result<()> {
        let delta = i64::try_from(bytes).map_err(|_| {
            StoreError::InvalidRequest(format!("Cannot reserve {} bytes", bytes))
        })?;
        self.space.reserve(&self.user, &self.user_dir, delta).await
    }

    async fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Ok(delta) = i64::try_from(bytes) else {
            warn!("Cannot release {} bytes for {}", bytes, self.user);
            return;
        };
        if let Err(e) = self.space.reserve(&self.user, &self.user_dir, -delta).await {
            warn!("Failed to release {} bytes for {}: {}", bytes, self.user, e);
        }
    }

    pub async fn space_info(&self) -> Result<SpaceInfo> {
        self.space.space_info(&self.user, &self.user_dir).await
    }

    /// Persists a new quota and drops the memoized figures.
    pub async fn set_quota(&self, quota: u64) -> Result<()> {
        space::write_quota(&self.user_dir, quota).await?;
        self.space.reset(&self.user).await;
        Ok(())
    }

    // ==================== Params ====================

    fn param_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidRequest(format!("Invalid param name: {:?}", name)));
        }
        Ok(self.path.join(PARAMS_DIR).join(name))
    }

    pub async fn get_param(&self, name: &str) -> Result<Option<serde_json::Value>> {
        match tokio::fs::read(self.param_path(name)?).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_param(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.param_path(name)?;
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec(value)?).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    // ==================== Introspection ====================

    pub async fn status(&self, obj: Option<&str>) -> Result<ObjectStatus> {
        check_obj_id(obj)?;
        status::get(&self.obj_dir(obj), &label(obj)).await
    }

    /// Ids of all non-root objects.
    pub async fn list_objects(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.path.join(OBJECTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn list_archive(&self, obj: Option<&str>) -> Result<Vec<u64>> {
        let mut versions = self.status(obj).await?.archived_versions;
        versions.sort_unstable();
        Ok(versions)
    }

    // ==================== Transactions ====================

    /// Opens a write transaction, returning its id.
    pub async fn start_transaction(
        &self,
        obj: Option<&str>,
        params: &TransactionParams,
    ) -> Result<String> {
        check_obj_id(obj)?;
        if let Some(diff) = &params.diff {
            diff.validate(params.version, params.sizes.segments)?;
        }
        obj_file::planned_size(
            params.sizes.header,
            params.sizes.segments,
            params.diff.as_ref(),
        )?;
        let lease = self.lease(obj);
        if !lease.acquire().await? {
            return Err(StoreError::ConcurrentTransaction(label(obj)));
        }

        let transaction_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.prepare_transaction(obj, &lease, &transaction_id, params).await {
            if let Err(cleanup) = self.cancel_transaction(obj, None).await {
                warn!("Cleanup after failed start on {} failed: {}", label(obj), cleanup);
            }
            return Err(e);
        }
        info!(
            "Started transaction {} on {} (version {})",
            transaction_id,
            label(obj),
            params.version
        );
        Ok(transaction_id)
    }

    async fn prepare_transaction(
        &self,
        obj: Option<&str>,
        lease: &DirLease,
        transaction_id: &str,
        params: &TransactionParams,
    ) -> Result<()> {
        if !params.is_new_obj {
            return self.prepare_version(obj, lease, transaction_id, params).await;
        }
        if params.diff.is_some() {
            return Err(StoreError::InvalidRequest(
                "A new object cannot start with a diff version".to_string(),
            ));
        }
        self.create_obj(obj).await?;
        let result = self.prepare_version(obj, lease, transaction_id, params).await;
        if result.is_err() {
            if let Err(e) = self.remove_obj(obj).await {
                warn!("Failed to remove half-created {}: {}", label(obj), e);
            }
        }
        result
    }

    /// Registers a new object, failing if its id is taken in any letter case.
    async fn create_obj(&self, obj: Option<&str>) -> Result<()> {
        let obj_dir = self.obj_dir(obj);
        let Some(id) = obj else {
            if file_len(&obj_dir.join(status::STATUS_FILE)).await?.is_some() {
                return Err(StoreError::ObjExist(label(obj)));
            }
            return status::set(&obj_dir, &ObjectStatus::new_obj()).await;
        };

        match tokio::fs::create_dir(&obj_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::ObjExist(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let folded = id.to_lowercase();
        let mut entries = tokio::fs::read_dir(self.path.join(OBJECTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name != id && name.to_lowercase() == folded {
                tokio::fs::remove_dir_all(&obj_dir).await?;
                return Err(StoreError::ObjExist(id.to_string()));
            }
        }
        status::set(&obj_dir, &ObjectStatus::new_obj()).await
    }

    async fn prepare_version(
        &self,
        obj: Option<&str>,
        lease: &DirLease,
        transaction_id: &str,
        params: &TransactionParams,
    ) -> Result<()> {
        if !params.is_new_obj {
            let status = self.status(obj).await?;
            let current = match (status.state, status.current_version) {
                (ObjState::Current, Some(v)) => v,
                _ => return Err(StoreError::ObjUnknown(label(obj))),
            };
            if params.version <= current {
                return Err(StoreError::MismatchedObjVersion { current_version: current });
            }
            if let Some(diff) = &params.diff {
                if !status.live_versions().contains(&diff.base_version) {
                    return Err(StoreError::ObjVerUnknown {
                        obj: label(obj),
                        version: diff.base_version,
                    });
                }
                let base = self.layout(obj, diff.base_version).await?;
                if diff.base_extent() > base.logical_segs_len() {
                    return Err(StoreError::InvalidRequest(format!(
                        "Diff reads {} bytes of base version {} holding {}",
                        diff.base_extent(),
                        diff.base_version,
                        base.logical_segs_len()
                    )));
                }
            }
        }

        let file_size = obj_file::planned_size(
            params.sizes.header,
            params.sizes.segments,
            params.diff.as_ref(),
        )?;
        self.reserve(file_size).await?;

        let created = obj_file::create(
            &lease.version_file(),
            params.sizes.header,
            params.sizes.segments,
            params.diff.as_ref(),
        )
        .await;
        let layout = match created {
            Ok(layout) => layout,
            Err(e) => {
                self.release(file_size).await;
                return Err(e);
            }
        };

        let record = TransactionRecord {
            transaction_id: transaction_id.to_string(),
            transaction_type: params.transaction_type(),
            version: params.version,
            is_new_obj: params.is_new_obj,
            sizes: params.sizes,
            diff: params.diff.clone(),
            header_offset: layout.header_offset,
            segs_offset: layout.segs_offset,
            started_at: Utc::now(),
        };
        if let Err(e) = lease.write_record(&record).await {
            self.release(file_size).await;
            return Err(e);
        }
        Ok(())
    }

    /// The lease and record of the open transaction `transaction_id`.
    async fn open_transaction(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
    ) -> Result<(DirLease, TransactionRecord)> {
        check_obj_id(obj)?;
        let lease = self.lease(obj);
        match lease.read_record().await? {
            Some(record) if record.transaction_id == transaction_id => Ok((lease, record)),
            _ => Err(StoreError::TransactionUnknown(label(obj))),
        }
    }

    /// Writes the header of the version being built.
    pub async fn write_header(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let (lease, record) = self.open_transaction(obj, transaction_id).await?;
        if bytes.len() as u64 > record.sizes.header {
            return Err(StoreError::WriteOverflow(transaction_id.to_string()));
        }
        write_at(&lease.version_file(), record.header_offset, bytes).await?;
        debug!("Wrote {} header bytes in {}", bytes.len(), transaction_id);
        Ok(())
    }

    /// Writes segment bytes at `offset` of a transaction of known size.
    pub async fn write_segs(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
        offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let (lease, record) = self.open_transaction(obj, transaction_id).await?;
        let (TransactionType::Write, Some(size)) = (record.transaction_type, record.sizes.segments)
        else {
            return Err(StoreError::IncompatibleTransaction(transaction_id.to_string()));
        };
        if offset.saturating_add(bytes.len() as u64) > size {
            return Err(StoreError::WriteOverflow(transaction_id.to_string()));
        }
        write_at(&lease.version_file(), record.segs_offset + offset, bytes).await?;
        debug!("Wrote {} segment bytes at {} in {}", bytes.len(), offset, transaction_id);
        Ok(())
    }

    /// Appends segment bytes to a transaction of unknown size.
    ///
    /// When `is_last` is set the transaction is completed and the new
    /// version number returned.
    pub async fn append_segs(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
        bytes: &[u8],
        is_last: bool,
    ) -> Result<Option<u64>> {
        let (lease, record) = self.open_transaction(obj, transaction_id).await?;
        if record.transaction_type != TransactionType::Append {
            return Err(StoreError::IncompatibleTransaction(transaction_id.to_string()));
        }

        if !bytes.is_empty() {
            let path = lease.version_file();
            let mut file = OpenOptions::new().append(true).open(&path).await?;
            let before = file.metadata().await?.len();
            if before.saturating_add(bytes.len() as u64) > obj_file::MAX_U40 {
                return Err(StoreError::WriteOverflow(transaction_id.to_string()));
            }
            self.reserve(bytes.len() as u64).await?;

            if let Err(e) = self.append_bytes(&mut file, bytes).await {
                if let Err(truncate) = file.set_len(before).await {
                    warn!("Failed to truncate {:?} after failed append: {}", path, truncate);
                }
                self.release(bytes.len() as u64).await;
                return Err(e.into());
            }
            debug!("Appended {} segment bytes in {}", bytes.len(), transaction_id);
        }

        if is_last {
            return self.complete_transaction(obj, transaction_id).await.map(Some);
        }
        Ok(None)
    }

    async fn append_bytes(&self, file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            file.write_all(&bytes[..bytes.len() / 2]).await?;
            file.flush().await?;
            return Err(std::io::Error::other("append interrupted"));
        }
        file.write_all(bytes).await?;
        file.flush().await
    }

    /// Makes the transaction's version current, returning its number.
    pub async fn complete_transaction(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
    ) -> Result<u64> {
        let (lease, record) = self.open_transaction(obj, transaction_id).await?;
        let obj_dir = self.obj_dir(obj);
        let mut status = self.status(obj).await?;

        let target = obj_dir.join(obj_file::version_file_name(record.version));
        tokio::fs::rename(lease.version_file(), &target).await?;
        let superseded = status.set_current(record.version);
        status::set(&obj_dir, &status).await?;

        if superseded.is_some() {
            self.collect_garbage(obj, &status).await;
        }
        if let Err(e) = lease.release().await {
            warn!("Failed to release lease of {}: {}", label(obj), e);
        }
        info!(
            "Completed transaction {} on {}: version {} is current",
            transaction_id,
            label(obj),
            record.version
        );
        Ok(record.version)
    }

    /// Aborts the transaction on `obj`.
    ///
    /// Cancelling an absent transaction succeeds. Without a transaction id
    /// any lease is broken, including one held by a live writer, so callers
    /// should only do that for leases they consider abandoned.
    pub async fn cancel_transaction(
        &self,
        obj: Option<&str>,
        transaction_id: Option<&str>,
    ) -> Result<()> {
        check_obj_id(obj)?;
        let lease = self.lease(obj);
        let (record, unreadable) = match lease.read_record().await {
            Ok(record) => (record, false),
            Err(e) if transaction_id.is_none() => {
                warn!("Unreadable transaction record on {}: {}", label(obj), e);
                (None, true)
            }
            Err(e) => return Err(e),
        };
        match (&record, transaction_id) {
            (Some(record), Some(id)) if record.transaction_id != id => {
                return Err(StoreError::TransactionUnknown(label(obj)));
            }
            (None, Some(_)) => return Ok(()),
            _ => {}
        }

        if record.is_some() || unreadable {
            match file_len(&lease.version_file()).await {
                Ok(size) => self.release(size.unwrap_or(0)).await,
                Err(e) => warn!("Cannot size cancelled version of {}: {}", label(obj), e),
            }
        }
        let new_obj = match &record {
            Some(record) => record.is_new_obj,
            // An object still in the `new` state has no transaction but this one.
            None if unreadable => matches!(
                self.status(obj).await,
                Ok(status) if status.state == ObjState::New
            ),
            None => false,
        };
        if new_obj {
            if let Err(e) = self.remove_obj(obj).await {
                warn!("Failed to remove cancelled new object {}: {}", label(obj), e);
            }
        }
        lease.release().await?;
        if let Some(record) = record {
            info!("Cancelled transaction {} on {}", record.transaction_id, label(obj));
        }
        Ok(())
    }

    /// Starts, fills, and completes a transaction in one call.
    pub async fn save_obj(
        &self,
        obj: Option<&str>,
        params: &TransactionParams,
        header: &[u8],
        segs: &[u8],
    ) -> Result<u64> {
        let transaction_id = self.start_transaction(obj, params).await?;
        let result = self.fill_and_complete(obj, &transaction_id, params, header, segs).await;
        if result.is_err() {
            if let Err(e) = self.cancel_transaction(obj, Some(&transaction_id)).await {
                warn!("Failed to cancel {} after failed save: {}", transaction_id, e);
            }
        }
        result
    }

    async fn fill_and_complete(
        &self,
        obj: Option<&str>,
        transaction_id: &str,
        params: &TransactionParams,
        header: &[u8],
        segs: &[u8],
    ) -> Result<u64> {
        self.write_header(obj, transaction_id, header).await?;
        match params.transaction_type() {
            TransactionType::Write => {
                self.write_segs(obj, transaction_id, 0, segs).await?;
                self.complete_transaction(obj, transaction_id).await
            }
            TransactionType::Append => {
                match self.append_segs(obj, transaction_id, segs, true).await? {
                    Some(version) => Ok(version),
                    None => Err(StoreError::TransactionUnknown(label(obj))),
                }
            }
        }
    }

    /// Cancels every transaction older than `max_age`, returning the objects
    /// whose leases were broken.
    pub async fn cancel_stale_transactions(
        &self,
        max_age: Duration,
    ) -> Result<Vec<Option<String>>> {
        let mut candidates: Vec<Option<String>> = vec![None];
        let mut entries = tokio::fs::read_dir(self.path.join(TRANSACTIONS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                candidates.push(Some(name.to_string()));
            }
        }

        let mut cancelled = Vec::new();
        for obj in candidates {
            let lease = self.lease(obj.as_deref());
            if !lease.is_held().await? {
                continue;
            }
            let age = match lease.read_record().await {
                Ok(Some(record)) => (Utc::now() - record.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                _ => lease.age().await?,
            };
            if age < max_age {
                continue;
            }
            warn!(
                "Breaking stale lease on {} ({}s old)",
                label(obj.as_deref()),
                age.as_secs()
            );
            self.cancel_transaction(obj.as_deref(), None).await?;
            cancelled.push(obj);
        }
        Ok(cancelled)
    }

    // ==================== Reads ====================

    /// Opens the current version of `obj`.
    pub async fn get_current_obj(&self, obj: Option<&str>, req: ReadRequest) -> Result<ObjReader> {
        let status = self.status(obj).await?;
        match (status.state, status.current_version) {
            (ObjState::Current, Some(version)) => self.open_version(obj, version, req).await,
            _ => Err(StoreError::ObjUnknown(label(obj))),
        }
    }

    /// Opens an archived version of `obj`.
    pub async fn get_archived_obj_version(
        &self,
        obj: Option<&str>,
        version: u64,
        req: ReadRequest,
    ) -> Result<ObjReader> {
        let status = self.status(obj).await?;
        if !status.is_archived(version) {
            return Err(StoreError::ObjVerUnknown { obj: label(obj), version });
        }
        self.open_version(obj, version, req).await
    }

    async fn open_version(
        &self,
        obj: Option<&str>,
        version: u64,
        req: ReadRequest,
    ) -> Result<ObjReader> {
        let layout = self.layout(obj, version).await?;
        let obj_dir = self.obj_dir(obj);

        let header = if req.header {
            let path = obj_dir.join(obj_file::version_file_name(version));
            let mut file = File::open(path).await?;
            file.seek(SeekFrom::Start(layout.header_offset)).await?;
            let mut buf = vec![0u8; layout.header_len() as usize];
            file.read_exact(&mut buf).await?;
            Some(Bytes::from(buf))
        } else {
            None
        };

        let segs_total = layout.logical_segs_len();
        let (offset, len) = req.clamp(segs_total);
        let versions = ObjVersions { store: self, obj };
        let reads = diff::plan_reads(&versions, version, offset, len).await?;

        Ok(ObjReader {
            version,
            header,
            segs_total,
            segs: SegsSource::open(&obj_dir, reads).await?,
        })
    }

    // ==================== Removal ====================

    /// Retains the current version as archived, returning its number.
    pub async fn archive_current_version(&self, obj: Option<&str>) -> Result<u64> {
        check_obj_id(obj)?;
        let lease = self.lease(obj);
        if !lease.acquire().await? {
            return Err(StoreError::ConcurrentTransaction(label(obj)));
        }
        let result = self.archive_current_locked(obj).await;
        keep_outcome(obj, result, lease.release().await)
    }

    async fn archive_current_locked(&self, obj: Option<&str>) -> Result<u64> {
        let mut status = self.status(obj).await?;
        if status.state != ObjState::Current {
            return Err(StoreError::ObjUnknown(label(obj)));
        }
        let Some(version) = status.archive_current() else {
            return Err(StoreError::ObjUnknown(label(obj)));
        };
        status::set(&self.obj_dir(obj), &status).await?;
        info!("Archived version {} of {}", version, label(obj));
        Ok(version)
    }

    /// Deletes the current version of `obj`, or one archived version.
    ///
    /// Files stay on disk while any remaining version still needs them.
    pub async fn delete_obj(&self, obj: Option<&str>, arch_version: Option<u64>) -> Result<()> {
        check_obj_id(obj)?;
        if obj.is_none() && arch_version.is_none() {
            return Err(StoreError::InvalidRequest(
                "The root object's current version cannot be deleted".to_string(),
            ));
        }
        let lease = self.lease(obj);
        if !lease.acquire().await? {
            return Err(StoreError::ConcurrentTransaction(label(obj)));
        }
        let result = self.delete_locked(obj, arch_version).await;
        keep_outcome(obj, result, lease.release().await)
    }

    async fn delete_locked(&self, obj: Option<&str>, arch_version: Option<u64>) -> Result<()> {
        let mut status = self.status(obj).await?;
        let removal = match arch_version {
            Some(version) => status
                .remove_archived(version)
                .ok_or_else(|| StoreError::ObjVerUnknown { obj: label(obj), version })?,
            None => {
                if status.state != ObjState::Current {
                    return Err(StoreError::ObjUnknown(label(obj)));
                }
                status.remove_current()
            }
        };

        match removal {
            Removal::Gone => {
                self.remove_obj(obj).await?;
                info!("Removed {}", label(obj));
            }
            Removal::Archived => {
                status::set(&self.obj_dir(obj), &status).await?;
                self.collect_garbage(obj, &status).await;
                info!("Deleted {:?} of {}", arch_version, label(obj));
            }
        }
        Ok(())
    }

    /// Removes an object's status and version files.
    async fn remove_obj(&self, obj: Option<&str>) -> Result<()> {
        let obj_dir = self.obj_dir(obj);
        let mut freed = 0;
        let mut entries = match tokio::fs::read_dir(&obj_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if obj_file::parse_version_file_name(&name).is_some() {
                freed += entry.metadata().await?.len();
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        match obj {
            None => match tokio::fs::remove_file(obj_dir.join(status::STATUS_FILE)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
            Some(_) => tokio::fs::remove_dir_all(&obj_dir).await?,
        }
        self.forget_layouts(obj);
        self.release(freed).await;
        Ok(())
    }

    /// Versions that must stay on disk: live ones and their base chains.
    async fn referenced_versions(
        &self,
        obj: Option<&str>,
        status: &ObjectStatus,
    ) -> Result<HashSet<u64>> {
        let mut keep = HashSet::new();
        let mut pending = status.live_versions();
        while let Some(version) = pending.pop() {
            if !keep.insert(version) {
                continue;
            }
            if let Some(diff) = self.layout(obj, version).await?.diff {
                pending.push(diff.base_version);
            }
        }
        Ok(keep)
    }

    /// Deletes version files nothing refers to any more.
    async fn collect_garbage(&self, obj: Option<&str>, status: &ObjectStatus) {
        if let Err(e) = self.try_collect_garbage(obj, status).await {
            warn!("Failed to collect old versions of {}: {}", label(obj), e);
        }
    }

    async fn try_collect_garbage(&self, obj: Option<&str>, status: &ObjectStatus) -> Result<()> {
        let keep = self.referenced_versions(obj, status).await?;
        let obj_dir = self.obj_dir(obj);
        let mut entries = tokio::fs::read_dir(&obj_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(version) = obj_file::parse_version_file_name(&name.to_string_lossy()) else {
                continue;
            };
            if keep.contains(&version) {
                continue;
            }
            let size = entry.metadata().await?.len();
            tokio::fs::remove_file(entry.path()).await?;
            self.lock_layouts().pop(&(obj.map(str::to_string), version));
            self.release(size).await;
            debug!("Removed unreferenced version {} of {}", version, label(obj));
        }
        Ok(())
    }
}

/// The versions of one object, as seen by the diff planner.
struct ObjVersions<'a> {
    store: &'a Store,
    obj: Option<&'a str>,
}

#[async_trait]
impl VersionLayouts for ObjVersions<'_> {
    async fn layout(&self, version: u64) -> Result<FileLayout> {
        self.store.layout(self.obj, version).await
    }
}
