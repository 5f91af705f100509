//! Prometheus metrics export
//!
//! Counters for pruning and verification runs plus per-store gauges.

use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry, CounterVec, Encoder,
    GaugeVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use sidb_core::{StoreId, VerificationJob, VerificationState};
use sidb_storage::{LogicalPruneResult, PhysicalPruneResult};
use tracing::error;

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    pub enabled: bool,
    /// Namespace prefix for metrics
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "sidb".to_string(),
        }
    }
}

/// Engine metrics
pub struct Metrics {
    registry: Registry,
    config: MetricsConfig,

    // Pruning
    pub sweep_runs_total: CounterVec,
    pub zero_ref_confirmed_total: CounterVec,
    pub chunks_pruned_total: CounterVec,
    pub bytes_freed_total: CounterVec,
    pub delete_failures_total: CounterVec,
    pub deferred_total: CounterVec,

    // Verification
    pub verification_runs_total: CounterVec,
    pub bad_chunks_total: CounterVec,

    // Backups
    pub promoted_backups_total: CounterVec,

    // Per-store state
    pub pending_entries: GaugeVec,
    pub zero_ref_signatures: GaugeVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new(config: MetricsConfig) -> anyhow::Result<Self> {
        let registry = Registry::new();
        let ns = &config.namespace;

        let sweep_runs_total = register_counter_vec_with_registry!(
            Opts::new("sweep_runs_total", "Mark-and-sweep runs").namespace(ns),
            &["store"],
            registry
        )?;

        let zero_ref_confirmed_total = register_counter_vec_with_registry!(
            Opts::new(
                "zero_ref_confirmed_total",
                "Signatures confirmed zero-ref by the sweep"
            )
            .namespace(ns),
            &["store"],
            registry
        )?;

        let chunks_pruned_total = register_counter_vec_with_registry!(
            Opts::new("chunks_pruned_total", "Chunks physically deleted").namespace(ns),
            &["store"],
            registry
        )?;

        let bytes_freed_total = register_counter_vec_with_registry!(
            Opts::new("bytes_freed_total", "Bytes freed by physical pruning").namespace(ns),
            &["store"],
            registry
        )?;

        let delete_failures_total = register_counter_vec_with_registry!(
            Opts::new("delete_failures_total", "Chunks whose delete ran out of attempts")
                .namespace(ns),
            &["store"],
            registry
        )?;

        let deferred_total = register_counter_vec_with_registry!(
            Opts::new("deferred_total", "Entries or chunks deferred to a later cycle")
                .namespace(ns),
            &["store", "reason"], // "offline", "busy" or "substore"
            registry
        )?;

        let verification_runs_total = register_counter_vec_with_registry!(
            Opts::new("verification_runs_total", "DV2 runs by final state").namespace(ns),
            &["store", "result"],
            registry
        )?;

        let bad_chunks_total = register_counter_vec_with_registry!(
            Opts::new("bad_chunks_total", "Chunks added to the drop ledger").namespace(ns),
            &["store"],
            registry
        )?;

        let promoted_backups_total = register_counter_vec_with_registry!(
            Opts::new(
                "promoted_backups_total",
                "Backups promoted to full after a verification failure"
            )
            .namespace(ns),
            &["store"],
            registry
        )?;

        let pending_entries = register_gauge_vec_with_registry!(
            Opts::new("pending_entries", "Deletion-pending entries").namespace(ns),
            &["store"],
            registry
        )?;

        let zero_ref_signatures = register_gauge_vec_with_registry!(
            Opts::new("zero_ref_signatures", "Confirmed zero-ref signatures").namespace(ns),
            &["store"],
            registry
        )?;

        Ok(Self {
            registry,
            config,
            sweep_runs_total,
            zero_ref_confirmed_total,
            chunks_pruned_total,
            bytes_freed_total,
            delete_failures_total,
            deferred_total,
            verification_runs_total,
            bad_chunks_total,
            promoted_backups_total,
            pending_entries,
            zero_ref_signatures,
        })
    }

    /// Check if metrics are enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn record_logical(&self, store: StoreId, result: &LogicalPruneResult) {
        let store = store.to_string();
        self.sweep_runs_total.with_label_values(&[&store]).inc();
        self.zero_ref_confirmed_total
            .with_label_values(&[&store])
            .inc_by(result.signatures_confirmed as f64);
        self.deferred_total
            .with_label_values(&[&store, "offline"])
            .inc_by(result.entries_blocked as f64);
        self.deferred_total
            .with_label_values(&[&store, "substore"])
            .inc_by(result.entries_deferred as f64);
    }

    pub fn record_physical(&self, store: StoreId, result: &PhysicalPruneResult) {
        let store = store.to_string();
        self.chunks_pruned_total
            .with_label_values(&[&store])
            .inc_by(result.chunks_deleted as f64);
        self.bytes_freed_total
            .with_label_values(&[&store])
            .inc_by(result.bytes_freed as f64);
        self.delete_failures_total
            .with_label_values(&[&store])
            .inc_by(result.delete_failures as f64);
        self.deferred_total
            .with_label_values(&[&store, "offline"])
            .inc_by(result.blocked_offline as f64);
        self.deferred_total
            .with_label_values(&[&store, "busy"])
            .inc_by(result.busy as f64);
    }

    pub fn record_verification(&self, job: &VerificationJob) {
        let store = job.store.to_string();
        let result = match job.state {
            VerificationState::Completed => "completed",
            VerificationState::CompletedWithErrors => "completed_with_errors",
            VerificationState::Killed => "killed",
            VerificationState::Scheduled | VerificationState::Running => "unfinished",
        };
        self.verification_runs_total
            .with_label_values(&[&store, result])
            .inc();
        self.bad_chunks_total
            .with_label_values(&[&store])
            .inc_by(job.chunks_bad as f64);
    }

    pub fn record_promotion(&self, store: StoreId) {
        self.promoted_backups_total
            .with_label_values(&[&store.to_string()])
            .inc();
    }

    /// Update per-store gauges
    pub fn update_store_gauges(&self, store: StoreId, pending: usize, zero_refs: u64) {
        let store = store.to_string();
        self.pending_entries
            .with_label_values(&[&store])
            .set(pending as f64);
        self.zero_ref_signatures
            .with_label_values(&[&store])
            .set(zero_refs as f64);
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
