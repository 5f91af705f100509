//! Persistence layer for engine state
//!
//! Stores the catalog tables, the signature index and mount path states to
//! JSON files on disk.

use serde::{Deserialize, Serialize};
use sidb_storage::{CatalogTables, DedupSnapshot, MountPath};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::tasks::TaskSnapshot;

const STATE_VERSION: u32 = 1;

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Base directory for data files
    pub data_dir: PathBuf,
}

impl PersistenceConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    fn tasks_file(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        // Default to ~/.sidb/
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self::new(format!("{}/.sidb", home))
    }
}

/// Data format for the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateData {
    pub version: u32,
    pub catalog: CatalogTables,
    pub dedup: DedupSnapshot,
    pub mount_paths: Vec<MountPath>,
}

/// Data format for tasks file
#[derive(Debug, Serialize, Deserialize)]
struct TasksData {
    version: u32,
    tasks: Vec<TaskSnapshot>,
}

/// Persistence manager
pub struct PersistenceManager {
    config: PersistenceConfig,
}

impl PersistenceManager {
    /// Create a new persistence manager
    pub async fn new(config: PersistenceConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir).await?;

        info!("Persistence initialized at {:?}", config.data_dir);
        Ok(Self { config })
    }

    /// Load engine state; `None` when starting fresh
    pub async fn load_state(&self) -> anyhow::Result<Option<StateData>> {
        let path = self.config.state_file();
        if !fs::try_exists(&path).await? {
            info!("No state file found, starting fresh");
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let data: StateData = serde_json::from_str(&content)?;
        if data.version != STATE_VERSION {
            anyhow::bail!(
                "unsupported state version {} (expected {})",
                data.version,
                STATE_VERSION
            );
        }

        info!(
            "Loaded state: {} stores, {} jobs, {} pending entries",
            data.dedup.stores.len(),
            data.catalog.jobs.len(),
            data.catalog.pending.len()
        );
        Ok(Some(data))
    }

    /// Save engine state to disk
    pub async fn save_state(&self, mut data: StateData) -> anyhow::Result<()> {
        data.version = STATE_VERSION;
        let content = serde_json::to_string_pretty(&data)?;
        write_atomic(&self.config.state_file(), &content).await
    }

    /// Load tasks from disk
    pub async fn load_tasks(&self) -> anyhow::Result<Vec<TaskSnapshot>> {
        let path = self.config.tasks_file();
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let data: TasksData = serde_json::from_str(&content)?;

        info!("Loaded {} tasks from disk", data.tasks.len());
        Ok(data.tasks)
    }

    /// Save tasks to disk
    pub async fn save_tasks(&self, tasks: &[TaskSnapshot]) -> anyhow::Result<()> {
        let data = TasksData {
            version: STATE_VERSION,
            tasks: tasks.to_vec(),
        };
        let content = serde_json::to_string_pretty(&data)?;
        write_atomic(&self.config.tasks_file(), &content).await
    }
}

// Write to temp file first, then rename (atomic)
async fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidb_storage::DedupStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fresh_start() {
        let dir = TempDir::new().unwrap();
        let manager = PersistenceManager::new(PersistenceConfig::new(dir.path()))
            .await
            .unwrap();
        assert!(manager.load_state().await.unwrap().is_none());
        assert!(manager.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = PersistenceManager::new(PersistenceConfig::new(dir.path()))
            .await
            .unwrap();

        let dedup = DedupStore::new();
        let store = dedup.create_store("S");
        dedup.add_partition(store, "/ddb/p1", "ma1", false).unwrap();

        manager
            .save_state(StateData {
                dedup: dedup.snapshot(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!dir.path().join("state.json.tmp").exists());

        let loaded = manager.load_state().await.unwrap().unwrap();
        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.dedup.stores.len(), 1);
        assert_eq!(loaded.dedup.substores.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = PersistenceManager::new(PersistenceConfig::new(dir.path()))
            .await
            .unwrap();
        let data = StateData {
            version: 99,
            ..Default::default()
        };
        std::fs::write(
            dir.path().join("state.json"),
            serde_json::to_string(&data).unwrap(),
        )
        .unwrap();
        assert!(manager.load_state().await.is_err());
    }
}
