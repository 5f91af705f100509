//! Two-phase pruning of deleted jobs
//!
//! Logical phase (mark and sweep): release the references each
//! deletion-pending entry carries, then confirm which signatures are still
//! unreferenced once the scan is over. Physical phase: delete the folders
//! of chunks whose signatures are all confirmed zero-ref.
//!
//! Entry lifecycle:
//! `LogicalPruneStaged -> MarkAndSweepPending -> ZeroRef -> (removed)`,
//! with `BlockedOffline` while the chunk's mount path is offline and
//! `DeleteFailed` once physical deletion ran out of attempts.

use chrono::Utc;
use sidb_core::{
    Alert, AlertKind, CancelFlag, ChunkId, ChunkRecord, Config, DeletionPendingEntry, JobId,
    PendingStatus, PruneEvent, PrunePhase, StoreId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{ChunkLocation, ChunkStore};
use crate::catalog::MetadataStore;
use crate::dedup::{DedupStore, Reclaimability};
use crate::error::{StorageError, StorageResult};
use crate::leases::ChunkLeases;
use crate::mountpath::MountPathAvailability;

/// Pruning options
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Only report what would be deleted, don't actually delete
    pub dry_run: bool,
    /// Maximum number of chunks to delete in one run
    pub max_delete: Option<usize>,
}

/// Mark-and-sweep result
#[derive(Debug, Clone, Default)]
pub struct LogicalPruneResult {
    /// Entries looked at by the mark step
    pub entries_examined: u64,
    /// Reference decrements applied
    pub references_released: u64,
    /// Signatures whose count reached zero during the mark step
    pub signatures_marked: u64,
    /// Signatures the sweep flipped to zero-ref
    pub signatures_confirmed: u64,
    /// Entries now waiting for physical pruning
    pub entries_zero_ref: u64,
    /// Entries retired because their chunk is still referenced elsewhere
    pub entries_released: u64,
    /// Entries parked because the chunk's mount path is offline
    pub entries_blocked: u64,
    /// Entries left for the next cycle after a transient error
    pub entries_deferred: u64,
    /// Set when the run stopped early on cancellation
    pub cancelled: bool,
    /// Errors encountered
    pub errors: Vec<String>,
}

/// Physical pruning result
#[derive(Debug, Clone, Default)]
pub struct PhysicalPruneResult {
    /// Pruning is disabled for the store
    pub skipped: bool,
    /// Distinct chunks considered
    pub chunks_examined: u64,
    /// Chunk folders removed
    pub chunks_deleted: u64,
    /// Bytes freed
    pub bytes_freed: u64,
    /// Deletion-pending entries removed
    pub entries_removed: u64,
    /// Chunks whose mount path is offline
    pub blocked_offline: u64,
    /// Chunks held because the mount path has pruning disabled
    pub held: u64,
    /// Chunks with an active reader
    pub busy: u64,
    /// Chunks referenced again after their sweep
    pub resurrected: u64,
    /// Chunks whose delete failed after every attempt
    pub delete_failures: u64,
    /// Set when the run stopped early on cancellation
    pub cancelled: bool,
    /// Errors encountered
    pub errors: Vec<String>,
}

/// One full pruning cycle
#[derive(Debug, Clone, Default)]
pub struct PruneCycleResult {
    pub logical: LogicalPruneResult,
    pub physical: PhysicalPruneResult,
}

/// Pruning engine
pub struct PruningEngine {
    catalog: Arc<dyn MetadataStore>,
    dedup: Arc<DedupStore>,
    chunks: Arc<dyn ChunkStore>,
    mount_paths: Arc<MountPathAvailability>,
    leases: ChunkLeases,
    config: Arc<RwLock<Config>>,
}

impl PruningEngine {
    pub fn new(
        catalog: Arc<dyn MetadataStore>,
        dedup: Arc<DedupStore>,
        chunks: Arc<dyn ChunkStore>,
        mount_paths: Arc<MountPathAvailability>,
        leases: ChunkLeases,
        config: Arc<RwLock<Config>>,
    ) -> Self {
        Self {
            catalog,
            dedup,
            chunks,
            mount_paths,
            leases,
            config,
        }
    }

    /// Mark, sweep, then physically prune one store
    #[instrument(skip(self, options, cancel))]
    pub async fn run_cycle(
        &self,
        store: StoreId,
        options: &PruneOptions,
        cancel: &CancelFlag,
    ) -> StorageResult<PruneCycleResult> {
        let logical = self.run_logical(store, cancel).await?;
        let physical = if logical.cancelled {
            PhysicalPruneResult {
                cancelled: true,
                ..Default::default()
            }
        } else {
            self.run_physical(store, options, cancel).await?
        };
        Ok(PruneCycleResult { logical, physical })
    }

    /// Mark then sweep
    #[instrument(skip(self, cancel))]
    pub async fn run_logical(
        &self,
        store: StoreId,
        cancel: &CancelFlag,
    ) -> StorageResult<LogicalPruneResult> {
        let mut result = LogicalPruneResult::default();
        self.mark(store, cancel, &mut result).await?;
        if !result.cancelled {
            self.sweep(store, &mut result).await?;
        }
        info!(
            "Logical pruning of store {}: {} refs released, {} confirmed zero-ref, {} entries ready, {} blocked",
            store,
            result.references_released,
            result.signatures_confirmed,
            result.entries_zero_ref,
            result.entries_blocked
        );
        Ok(result)
    }

    /// Release the references of staged entries, one entry at a time
    async fn mark(
        &self,
        store: StoreId,
        cancel: &CancelFlag,
        result: &mut LogicalPruneResult,
    ) -> StorageResult<()> {
        self.dedup.store_info(store)?;
        info!("Mark: releasing references of staged entries in store {}", store);

        for mut entry in self.catalog.pending(store).await {
            if cancel.is_cancelled() {
                warn!("Mark of store {} cancelled", store);
                result.cancelled = true;
                return Ok(());
            }

            let chunk = self.catalog.chunk(entry.chunk).await;
            let path_online = match &chunk {
                Some(c) => match self.mount_paths.is_online(c.mount_path) {
                    Ok(online) => online,
                    Err(e) => {
                        result.errors.push(format!("chunk {}: {}", entry.chunk, e));
                        continue;
                    }
                },
                None => true,
            };

            if entry.status == PendingStatus::BlockedOffline {
                if !path_online {
                    result.entries_blocked += 1;
                    continue;
                }
                debug!("Mount path of chunk {} back online", entry.chunk);
                let resumed = if entry.logical_done {
                    PendingStatus::MarkAndSweepPending
                } else {
                    PendingStatus::LogicalPruneStaged
                };
                entry.set_status(resumed);
                self.catalog.put_pending(entry.clone()).await;
            }

            if entry.status != PendingStatus::LogicalPruneStaged {
                continue;
            }
            result.entries_examined += 1;

            if !path_online {
                debug!("Chunk {} is on an offline mount path", entry.chunk);
                entry.set_status(PendingStatus::BlockedOffline);
                self.catalog.put_pending(entry).await;
                result.entries_blocked += 1;
                continue;
            }

            match self.dedup.release_references(store, &entry.references) {
                Ok(marked) => {
                    result.references_released += entry.references.len() as u64;
                    result.signatures_marked += marked;
                    entry.logical_done = true;
                    entry.set_status(PendingStatus::MarkAndSweepPending);
                    let (job, chunk) = entry.key();
                    self.catalog.put_pending(entry).await;
                    self.record(store, PrunePhase::ReferencesReleased, Some(job), Some(chunk))
                        .await;
                }
                Err(e) if e.is_transient() => {
                    debug!("Deferring entry for chunk {}: {}", entry.chunk, e);
                    result.entries_deferred += 1;
                }
                Err(e) => {
                    warn!("Failed to release references of chunk {}: {}", entry.chunk, e);
                    result
                        .errors
                        .push(format!("job {} chunk {}: {}", entry.job, entry.chunk, e));
                }
            }
        }
        Ok(())
    }

    /// Confirm zero-refs after the scan and classify pending entries
    async fn sweep(&self, store: StoreId, result: &mut LogicalPruneResult) -> StorageResult<()> {
        result.signatures_confirmed = self.dedup.confirm_zero_refs(store)?;

        for mut entry in self.catalog.pending(store).await {
            if entry.status != PendingStatus::MarkAndSweepPending {
                continue;
            }
            let verdict = match self.catalog.chunk(entry.chunk).await {
                Some(chunk) => {
                    self.dedup
                        .chunk_reclaimability(store, chunk.id, &chunk.signatures)?
                }
                None => Reclaimability::Reclaimable,
            };

            match verdict {
                Reclaimability::Reclaimable => {
                    entry.set_status(PendingStatus::ZeroRef);
                    self.catalog.put_pending(entry).await;
                    result.entries_zero_ref += 1;
                }
                Reclaimability::Referenced => {
                    debug!("Chunk {} still referenced, retiring entry", entry.chunk);
                    self.retire(store, entry.job, entry.chunk).await;
                    result.entries_released += 1;
                }
                Reclaimability::Pending => {}
            }
        }
        Ok(())
    }

    /// Delete the folders of chunks whose entries reached zero-ref
    #[instrument(skip(self, options, cancel))]
    pub async fn run_physical(
        &self,
        store: StoreId,
        options: &PruneOptions,
        cancel: &CancelFlag,
    ) -> StorageResult<PhysicalPruneResult> {
        self.dedup.store_info(store)?;
        let config = self.config.read().await.clone();
        let mut result = PhysicalPruneResult::default();

        if !config.pruning_enabled(store) {
            info!("Pruning disabled for store {}", store);
            result.skipped = true;
            return Ok(result);
        }

        let mut by_chunk: BTreeMap<ChunkId, Vec<DeletionPendingEntry>> = BTreeMap::new();
        for entry in self.catalog.pending(store).await {
            if entry.status == PendingStatus::ZeroRef {
                by_chunk.entry(entry.chunk).or_default().push(entry);
            }
        }
        info!(
            "Physical pruning of store {}: {} candidate chunks",
            store,
            by_chunk.len()
        );

        let mut deletions = 0usize;
        for (chunk_id, entries) in by_chunk {
            if cancel.is_cancelled() {
                warn!("Physical pruning of store {} cancelled", store);
                result.cancelled = true;
                break;
            }
            if let Some(max) = options.max_delete {
                if deletions >= max {
                    warn!("Limiting deletion to {} chunks", max);
                    break;
                }
            }
            result.chunks_examined += 1;

            let Some(chunk) = self.catalog.chunk(chunk_id).await else {
                // Record already gone; nothing left on disk to track
                self.finalize(store, chunk_id, &mut result).await;
                continue;
            };

            match self.mount_paths.check_prunable(chunk.mount_path) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Pruning disabled on mount path of chunk {}", chunk_id);
                    result.held += 1;
                    continue;
                }
                Err(StorageError::MountPathOffline(_)) => {
                    self.set_status(entries, PendingStatus::BlockedOffline).await;
                    result.blocked_offline += 1;
                    continue;
                }
                Err(e) => {
                    result.errors.push(format!("chunk {}: {}", chunk_id, e));
                    continue;
                }
            }

            match self
                .dedup
                .chunk_reclaimability(store, chunk_id, &chunk.signatures)?
            {
                Reclaimability::Reclaimable => {}
                Reclaimability::Referenced => {
                    self.release_resurrected(store, &entries).await;
                    result.resurrected += 1;
                    continue;
                }
                Reclaimability::Pending => {
                    self.set_status(entries, PendingStatus::MarkAndSweepPending)
                        .await;
                    continue;
                }
            }

            if options.dry_run {
                info!("Dry run: would delete chunk {}", chunk_id);
                deletions += 1;
                continue;
            }

            let _lease = match self.leases.begin_delete(chunk_id) {
                Ok(lease) => lease,
                Err(e) => {
                    debug!("Deferring delete of chunk {}: {}", chunk_id, e);
                    result.busy += 1;
                    continue;
                }
            };

            let Some(reclaimed) = self
                .dedup
                .reclaim_chunk(store, chunk_id, &chunk.signatures)?
            else {
                self.release_resurrected(store, &entries).await;
                result.resurrected += 1;
                continue;
            };

            match self.delete_with_retry(&chunk, &config).await {
                Ok(()) => {
                    deletions += 1;
                    result.chunks_deleted += 1;
                    result.bytes_freed += chunk.size;
                    self.catalog.remove_chunk(chunk_id).await;
                    self.finalize(store, chunk_id, &mut result).await;
                }
                Err(e) => {
                    self.dedup.restore_entries(reclaimed);
                    result.delete_failures += 1;
                    result.errors.push(e.to_string());
                    self.fail_entries(store, &chunk, entries, &config, &e).await;
                }
            }
        }

        info!(
            "Physical pruning of store {}: deleted {} chunks ({} bytes), {} blocked, {} failed",
            store,
            result.chunks_deleted,
            result.bytes_freed,
            result.blocked_offline,
            result.delete_failures
        );
        Ok(result)
    }

    async fn delete_with_retry(&self, chunk: &ChunkRecord, config: &Config) -> StorageResult<()> {
        let location = ChunkLocation::from(chunk);
        let attempts = config.max_delete_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.chunks.delete_chunk(&location).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Delete of chunk {} failed (attempt {}/{}): {}",
                        chunk.id, attempt, attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                let backoff = config.delete_retry_backoff_ms * u64::from(attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(StorageError::PhysicalDelete {
            chunk: chunk.id,
            attempts,
            reason: last_error,
        })
    }

    async fn fail_entries(
        &self,
        store: StoreId,
        chunk: &ChunkRecord,
        entries: Vec<DeletionPendingEntry>,
        config: &Config,
        cause: &StorageError,
    ) {
        error!("Giving up on chunk {}: {}", chunk.id, cause);
        for mut entry in entries {
            entry.attempts += config.max_delete_attempts.max(1);
            entry.set_status(PendingStatus::DeleteFailed);
            self.catalog.put_pending(entry).await;
        }
        self.catalog
            .raise_alert(Alert {
                store,
                chunk: chunk.id,
                kind: AlertKind::PhysicalDeleteFailure,
                message: cause.to_string(),
                attempts: config.max_delete_attempts.max(1),
                raised_at: Utc::now(),
            })
            .await;
    }

    /// Chunk folder is gone: drop every entry and drop-ledger row for it
    /// and log phases 3 and 2
    async fn finalize(&self, store: StoreId, chunk: ChunkId, result: &mut PhysicalPruneResult) {
        let removed = self.catalog.remove_pending_for_chunk(chunk).await;
        result.entries_removed += removed.len() as u64;
        let cleared = self.catalog.clear_drops(chunk).await;
        if cleared > 0 {
            debug!("Cleared {} drop ledger rows for chunk {}", cleared, chunk);
        }
        self.record(store, PrunePhase::ChunkFinalized, None, Some(chunk))
            .await;

        let jobs: BTreeSet<JobId> = removed.iter().map(|e| e.job).collect();
        for job in jobs {
            self.complete_job_if_done(store, job).await;
        }
    }

    /// Entry no longer needs physical work
    async fn retire(&self, store: StoreId, job: JobId, chunk: ChunkId) {
        self.catalog.remove_pending(job, chunk).await;
        self.complete_job_if_done(store, job).await;
    }

    async fn release_resurrected(&self, store: StoreId, entries: &[DeletionPendingEntry]) {
        for entry in entries {
            debug!("Chunk {} referenced again, retiring entry", entry.chunk);
            self.retire(store, entry.job, entry.chunk).await;
        }
    }

    async fn complete_job_if_done(&self, store: StoreId, job: JobId) {
        if self.catalog.pending_for_job(job).await.is_empty() {
            self.record(store, PrunePhase::JobPruned, Some(job), None).await;
        }
    }

    async fn set_status(&self, entries: Vec<DeletionPendingEntry>, status: PendingStatus) {
        for mut entry in entries {
            entry.set_status(status);
            self.catalog.put_pending(entry).await;
        }
    }

    async fn record(
        &self,
        store: StoreId,
        phase: PrunePhase,
        job: Option<JobId>,
        chunk: Option<ChunkId>,
    ) {
        self.catalog
            .record_prune_event(PruneEvent {
                store,
                phase,
                job,
                chunk,
                at: Utc::now(),
            })
            .await;
    }

    /// Put entries that ran out of delete attempts back in line
    #[instrument(skip(self))]
    pub async fn retry_failed_deletes(&self, store: StoreId) -> StorageResult<usize> {
        self.dedup.store_info(store)?;
        let mut reset = 0;
        for mut entry in self.catalog.pending(store).await {
            if entry.status == PendingStatus::DeleteFailed {
                entry.attempts = 0;
                entry.set_status(PendingStatus::ZeroRef);
                self.catalog.put_pending(entry).await;
                reset += 1;
            }
        }
        info!("Reset {} failed deletes in store {}", reset, store);
        Ok(reset)
    }
}
