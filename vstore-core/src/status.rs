//! Per-object lifecycle records
//!
//! Each object folder holds a small JSON `status` file tracking whether the
//! object is new, has a current version, or only survives through archived
//! versions.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the status file inside an object folder.
pub const STATUS_FILE: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjState {
    New,
    Current,
    Archived,
}

/// Lifecycle record of one object.
///
/// `current_version` is set exactly when `state` is `Current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub state: ObjState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archived_versions: Vec<u64>,
}

/// What removing the current version left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Archived versions remain; the object is now archived.
    Archived,
    /// Nothing remains; the object folder can go.
    Gone,
}

impl ObjectStatus {
    pub fn new_obj() -> Self {
        Self {
            state: ObjState::New,
            current_version: None,
            archived_versions: Vec::new(),
        }
    }

    pub fn is_archived(&self, version: u64) -> bool {
        self.archived_versions.contains(&version)
    }

    /// Makes `version` current, returning the version it supersedes.
    pub fn set_current(&mut self, version: u64) -> Option<u64> {
        let previous = self.current_version.replace(version);
        self.state = ObjState::Current;
        previous
    }

    /// Retains the current version as archived; returns the archived version.
    pub fn archive_current(&mut self) -> Option<u64> {
        let version = self.current_version?;
        if !self.is_archived(version) {
            self.archived_versions.push(version);
        }
        Some(version)
    }

    /// Drops the current version.
    pub fn remove_current(&mut self) -> Removal {
        self.current_version = None;
        if self.archived_versions.is_empty() {
            Removal::Gone
        } else {
            self.state = ObjState::Archived;
            Removal::Archived
        }
    }

    /// Drops an archived version; `None` when it was not archived.
    pub fn remove_archived(&mut self, version: u64) -> Option<Removal> {
        let pos = self.archived_versions.iter().position(|v| *v == version)?;
        self.archived_versions.remove(pos);
        if self.state == ObjState::Archived && self.archived_versions.is_empty() {
            Some(Removal::Gone)
        } else {
            Some(Removal::Archived)
        }
    }

    /// Versions a reader may still ask for.
    pub fn live_versions(&self) -> Vec<u64> {
        let mut versions = self.archived_versions.clone();
        if let Some(v) = self.current_version {
            if !versions.contains(&v) {
                versions.push(v);
            }
        }
        versions
    }
}

/// Reads the status of the object stored in `obj_dir`.
///
/// `obj` is only used to label the error when no status exists.
pub async fn get(obj_dir: &Path, obj: &str) -> Result<ObjectStatus> {
    match tokio::fs::read(obj_dir.join(STATUS_FILE)).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::ObjUnknown(obj.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Overwrites the status of the object stored in `obj_dir`.
pub async fn set(obj_dir: &Path, status: &ObjectStatus) -> Result<()> {
    let path = obj_dir.join(STATUS_FILE);
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_vec(status)?;
    tokio::fs::write(&tmp_path, &data).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_shape() {
        let mut status = ObjectStatus::new_obj();
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"state":"new"}"#);
        status.set_current(4);
        status.archived_versions.push(2);
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"state":"current","currentVersion":4,"archivedVersions":[2]}"#
        );
    }

    #[test]
    fn test_transitions() {
        let mut status = ObjectStatus::new_obj();
        assert_eq!(status.set_current(1), None);
        assert_eq!(status.state, ObjState::Current);
        assert_eq!(status.set_current(2), Some(1));

        assert_eq!(status.archive_current(), Some(2));
        assert_eq!(status.archive_current(), Some(2));
        assert_eq!(status.archived_versions, vec![2]);

        assert_eq!(status.remove_current(), Removal::Archived);
        assert_eq!(status.state, ObjState::Archived);
        assert_eq!(status.current_version, None);

        assert_eq!(status.remove_archived(7), None);
        assert_eq!(status.remove_archived(2), Some(Removal::Gone));
    }

    #[test]
    fn test_remove_current_without_archive() {
        let mut status = ObjectStatus::new_obj();
        status.set_current(1);
        assert_eq!(status.remove_current(), Removal::Gone);
    }

    #[tokio::test]
    async fn test_get_and_set() {
        let dir = TempDir::new().unwrap();
        let err = get(dir.path(), "o1").await.unwrap_err();
        assert!(matches!(err, StoreError::ObjUnknown(ref id) if id == "o1"));

        let mut status = ObjectStatus::new_obj();
        status.set_current(3);
        set(dir.path(), &status).await.unwrap();
        assert_eq!(get(dir.path(), "o1").await.unwrap(), status);
        assert!(!dir.path().join("status.tmp").exists());
    }
}
