//! Pruning and verification configuration
//!
//! These are the additional settings an operator pushes to the
//! CommServe: sweep interval, per-store pruning switches, forced
//! re-verification and the DV2 policy toggles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ids::StoreId;

/// Shortest allowed mark-and-sweep interval (1 minute)
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 60;

/// Longest allowed mark-and-sweep interval (120 minutes)
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 120 * 60;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between mark-and-sweep cycles
    pub sweep_interval_secs: u64,
    /// Re-scan chunks in the drop ledger on incremental verification
    pub force_reverify: bool,
    /// Quick verification also checks the container file exists
    pub quick_verify_file_check: bool,
    /// Promote the next backup of a subclient to Full after a DV2 failure
    pub mark_next_backup_full_on_dv_failure: bool,
    /// Delete attempts per chunk within one physical prune pass
    pub max_delete_attempts: u32,
    /// Pause between delete attempts
    pub delete_retry_backoff_ms: u64,
    /// Default retention for every store
    pub retention: RetentionRule,
    /// Per-store overrides
    pub stores: BTreeMap<StoreId, StoreSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 3600,
            force_reverify: false,
            quick_verify_file_check: true,
            mark_next_backup_full_on_dv_failure: true,
            max_delete_attempts: 3,
            delete_retry_backoff_ms: 100,
            retention: RetentionRule::default(),
            stores: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        check_interval(self.sweep_interval_secs)?;
        for (store, settings) in &self.stores {
            if let Some(secs) = settings.sweep_interval_secs {
                check_interval(secs)
                    .map_err(|e| Error::InvalidConfig(format!("store {}: {}", store, e)))?;
            }
        }
        if self.max_delete_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_delete_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether pruning is enabled for a store (default on)
    pub fn pruning_enabled(&self, store: StoreId) -> bool {
        self.stores
            .get(&store)
            .map(|s| s.pruning_enabled)
            .unwrap_or(true)
    }

    pub fn sweep_interval(&self, store: StoreId) -> Duration {
        let secs = self
            .stores
            .get(&store)
            .and_then(|s| s.sweep_interval_secs)
            .unwrap_or(self.sweep_interval_secs);
        Duration::from_secs(secs)
    }

    pub fn retention(&self, store: StoreId) -> RetentionRule {
        self.stores
            .get(&store)
            .and_then(|s| s.retention)
            .unwrap_or(self.retention)
    }

    pub fn store_mut(&mut self, store: StoreId) -> &mut StoreSettings {
        self.stores.entry(store).or_default()
    }

    /// Per-store mark-and-sweep interval override
    pub fn set_sweep_interval(&mut self, store: StoreId, secs: u64) -> Result<()> {
        check_interval(secs)?;
        self.store_mut(store).sweep_interval_secs = Some(secs);
        Ok(())
    }

    pub fn with_pruning_disabled(mut self, store: StoreId) -> Self {
        self.store_mut(store).pruning_enabled = false;
        self
    }

    pub fn with_force_reverify(mut self, enabled: bool) -> Self {
        self.force_reverify = enabled;
        self
    }

    pub fn with_quick_verify_file_check(mut self, enabled: bool) -> Self {
        self.quick_verify_file_check = enabled;
        self
    }

    pub fn with_delete_backoff_ms(mut self, ms: u64) -> Self {
        self.delete_retry_backoff_ms = ms;
        self
    }
}

fn check_interval(secs: u64) -> Result<()> {
    if !(MIN_SWEEP_INTERVAL_SECS..=MAX_SWEEP_INTERVAL_SECS).contains(&secs) {
        return Err(Error::InvalidConfig(format!(
            "sweep interval {}s outside [{}, {}]",
            secs, MIN_SWEEP_INTERVAL_SECS, MAX_SWEEP_INTERVAL_SECS
        )));
    }
    Ok(())
}

/// Store-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub pruning_enabled: bool,
    pub sweep_interval_secs: Option<u64>,
    pub retention: Option<RetentionRule>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            pruning_enabled: true,
            sweep_interval_secs: None,
            retention: None,
        }
    }
}

/// Days-and-cycles retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub days: u32,
    pub cycles: u32,
}

impl Default for RetentionRule {
    fn default() -> Self {
        Self { days: 30, cycles: 2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sweep_interval_secs, 3600);
        assert!(!config.force_reverify);
        assert!(config.quick_verify_file_check);
        assert!(config.mark_next_backup_full_on_dv_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_bounds() {
        let mut config = Config::default();
        config.sweep_interval_secs = 30;
        assert!(config.validate().is_err());
        config.sweep_interval_secs = 7200;
        assert!(config.validate().is_ok());
        config.sweep_interval_secs = 7201;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_overrides() {
        let mut config = Config::default().with_pruning_disabled(StoreId(2));
        config.store_mut(StoreId(3)).sweep_interval_secs = Some(120);

        assert!(config.pruning_enabled(StoreId(1)));
        assert!(!config.pruning_enabled(StoreId(2)));
        assert_eq!(config.sweep_interval(StoreId(3)), Duration::from_secs(120));
        assert_eq!(config.sweep_interval(StoreId(1)), Duration::from_secs(3600));
        assert_eq!(config.retention(StoreId(2)), RetentionRule::default());
    }

    #[test]
    fn test_set_sweep_interval() {
        let mut config = Config::default();
        assert!(config.set_sweep_interval(StoreId(1), 10).is_err());
        config.set_sweep_interval(StoreId(1), 300).unwrap();
        assert_eq!(config.sweep_interval(StoreId(1)), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"force_reverify": true, "stores": {"4": {"pruning_enabled": false}}}"#)
                .unwrap();
        assert!(config.force_reverify);
        assert_eq!(config.sweep_interval_secs, 3600);
        assert!(!config.pruning_enabled(StoreId(4)));
    }
}
