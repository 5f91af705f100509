//! Mount path availability
//!
//! Online/offline state and access flags per mount path. Chunk writes and
//! physical pruning consult this before touching storage. Marking a path
//! offline takes effect immediately for every later check; writers already
//! in flight are not interrupted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sidb_core::MountPathId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPath {
    pub id: MountPathId,
    pub name: String,
    pub root: PathBuf,
    pub online: bool,
    pub access: AccessType,
    /// "Enable pruning of aged data" on the mount path
    pub pruning_enabled: bool,
    pub changed_at: DateTime<Utc>,
}

/// Registry of mount paths and their availability
#[derive(Debug)]
pub struct MountPathAvailability {
    paths: DashMap<MountPathId, MountPath>,
    next_id: AtomicU64,
}

impl Default for MountPathAvailability {
    fn default() -> Self {
        Self::new()
    }
}

impl MountPathAvailability {
    pub fn new() -> Self {
        Self {
            paths: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new online, read-write mount path
    pub fn add(&self, name: &str, root: impl AsRef<Path>) -> MountPathId {
        let id = MountPathId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.paths.insert(
            id,
            MountPath {
                id,
                name: name.to_string(),
                root: root.as_ref().to_path_buf(),
                online: true,
                access: AccessType::ReadWrite,
                pruning_enabled: true,
                changed_at: Utc::now(),
            },
        );
        info!("Added mount path {} ({}) at {:?}", id, name, root.as_ref());
        id
    }

    pub fn get(&self, id: MountPathId) -> StorageResult<MountPath> {
        self.paths
            .get(&id)
            .map(|p| p.clone())
            .ok_or(StorageError::MountPathNotFound(id))
    }

    pub fn root(&self, id: MountPathId) -> StorageResult<PathBuf> {
        self.paths
            .get(&id)
            .map(|p| p.root.clone())
            .ok_or(StorageError::MountPathNotFound(id))
    }

    pub fn list(&self) -> Vec<MountPath> {
        let mut paths: Vec<_> = self.paths.iter().map(|p| p.clone()).collect();
        paths.sort_by_key(|p| p.id);
        paths
    }

    fn update(&self, id: MountPathId, f: impl FnOnce(&mut MountPath)) -> StorageResult<()> {
        let mut path = self
            .paths
            .get_mut(&id)
            .ok_or(StorageError::MountPathNotFound(id))?;
        f(&mut path);
        path.changed_at = Utc::now();
        Ok(())
    }

    pub fn set_online(&self, id: MountPathId, online: bool) -> StorageResult<()> {
        self.update(id, |p| p.online = online)?;
        info!(
            "Mount path {} marked {}",
            id,
            if online { "online" } else { "offline" }
        );
        Ok(())
    }

    pub fn set_access(&self, id: MountPathId, access: AccessType) -> StorageResult<()> {
        self.update(id, |p| p.access = access)
    }

    pub fn set_pruning_enabled(&self, id: MountPathId, enabled: bool) -> StorageResult<()> {
        self.update(id, |p| p.pruning_enabled = enabled)
    }

    pub fn is_online(&self, id: MountPathId) -> StorageResult<bool> {
        Ok(self.get(id)?.online)
    }

    /// Fails unless the path is online and writable
    pub fn check_writable(&self, id: MountPathId) -> StorageResult<()> {
        let path = self.get(id)?;
        if !path.online {
            return Err(StorageError::MountPathOffline(id));
        }
        if path.access == AccessType::ReadOnly {
            return Err(StorageError::MountPathReadOnly(id));
        }
        Ok(())
    }

    /// `Ok(false)` when pruning of aged data is disabled on the path
    pub fn check_prunable(&self, id: MountPathId) -> StorageResult<bool> {
        let path = self.get(id)?;
        if !path.online {
            return Err(StorageError::MountPathOffline(id));
        }
        Ok(path.pruning_enabled)
    }

    pub fn snapshot(&self) -> Vec<MountPath> {
        self.list()
    }

    pub fn restore(&self, paths: Vec<MountPath>) {
        self.paths.clear();
        let mut max_id = 0;
        for path in paths {
            max_id = max_id.max(path.id.get());
            self.paths.insert(path.id, path);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
    }
}
