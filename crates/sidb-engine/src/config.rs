//! Engine configuration

use serde::{Deserialize, Serialize};
use sidb_core::{Config, VerifyDepth, VerifyScope};
use std::path::Path;

use crate::metrics::MetricsConfig;

/// Engine host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node name used in task ids
    pub node: String,
    /// Data directory for persistence
    pub data_dir: Option<String>,
    /// Mount paths registered at startup when the state has none
    pub mount_paths: Vec<MountPathConfig>,
    /// Stores created at startup when the state has none
    pub stores: Vec<StoreConfig>,
    /// Scheduled pruning cycles
    pub prune: PruneScheduleConfig,
    /// Scheduled DV2 runs
    pub verify: VerifyConfig,
    /// Scheduled data aging
    pub data_aging: DataAgingConfig,
    /// Seconds between state snapshots written by the daemon
    pub persist_interval_secs: u64,
    /// Store new chunk containers zstd-compressed
    pub compress_chunks: bool,
    /// Prometheus metrics
    pub metrics: MetricsConfig,
    /// Registry settings consumed by the engines
    pub settings: Config,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node: "localhost".to_string(),
            data_dir: None,
            mount_paths: Vec::new(),
            stores: Vec::new(),
            prune: PruneScheduleConfig::default(),
            verify: VerifyConfig::default(),
            data_aging: DataAgingConfig::default(),
            persist_interval_secs: 300,
            compress_chunks: true,
            metrics: MetricsConfig::default(),
            settings: Config::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engines or the scheduler cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings.validate()?;
        if self.verify.enabled && self.verify.interval_hours == 0 {
            anyhow::bail!("verify.interval_hours must be at least 1");
        }
        if self.data_aging.enabled && self.data_aging.interval_hours == 0 {
            anyhow::bail!("data_aging.interval_hours must be at least 1");
        }
        if self.persist_interval_secs == 0 {
            anyhow::bail!("persist_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Set data directory for persistence
    pub fn with_data_dir(mut self, path: &str) -> Self {
        self.data_dir = Some(path.to_string());
        self
    }

    /// Register a mount path at startup
    pub fn with_mount_path(mut self, name: &str, path: &str) -> Self {
        self.mount_paths.push(MountPathConfig {
            name: name.to_string(),
            path: path.to_string(),
        });
        self
    }

    /// Create a store with one partition at startup
    pub fn with_store(mut self, name: &str, partition: &str) -> Self {
        self.stores.push(StoreConfig {
            name: name.to_string(),
            partitions: vec![PartitionConfig {
                path: partition.to_string(),
                media_agent: self.node.clone(),
            }],
        });
        self
    }

    pub fn with_settings(mut self, settings: Config) -> Self {
        self.settings = settings;
        self
    }
}

/// Disk library mount path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPathConfig {
    pub name: String,
    pub path: String,
}

/// Dedup store bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub path: String,
    pub media_agent: String,
}

/// Pruning schedule; the interval comes from the store's sweep interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneScheduleConfig {
    pub enabled: bool,
}

impl Default for PruneScheduleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Verification scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Enable scheduled verification runs
    pub enabled: bool,
    /// Interval in hours between automatic verification runs
    pub interval_hours: u64,
    pub scope: VerifyScope,
    pub depth: VerifyDepth,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 24,
            scope: VerifyScope::Incremental,
            depth: VerifyDepth::Quick,
        }
    }
}

/// Data aging schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAgingConfig {
    pub enabled: bool,
    pub interval_hours: u64,
}

impl Default for DataAgingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
        }
    }
}
