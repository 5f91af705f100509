//! Metadata catalog
//!
//! Relational state the engines share: jobs, chunks, the deletion-pending
//! table, the chunk drop ledger and per-job verification status. The
//! engines only see the [`MetadataStore`] trait; [`MemoryCatalog`] keeps
//! everything in memory and snapshots to JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sidb_core::{
    Alert, ArchCheckStatus, ChunkDropEntry, ChunkId, ChunkRecord, DeletionPendingEntry, JobId,
    JobRecord, PruneEvent, PrunePhase, StoreId, SubclientId, VerificationJob, VerificationJobId,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};

/// Default number of prune events, alerts and finished verification jobs kept
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Typed query/update interface over the catalog tables
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn allocate_job_id(&self) -> JobId;
    async fn allocate_chunk_id(&self) -> ChunkId;
    async fn allocate_verification_job_id(&self) -> VerificationJobId;

    async fn put_job(&self, job: JobRecord);
    async fn job(&self, id: JobId) -> StorageResult<JobRecord>;
    async fn jobs(&self, store: Option<StoreId>) -> Vec<JobRecord>;

    async fn put_chunk(&self, chunk: ChunkRecord);
    async fn chunk(&self, id: ChunkId) -> Option<ChunkRecord>;
    async fn chunks(&self, store: StoreId) -> Vec<ChunkRecord>;
    async fn remove_chunk(&self, id: ChunkId) -> Option<ChunkRecord>;
    async fn mark_chunk_verified(&self, id: ChunkId, at: DateTime<Utc>);

    async fn put_pending(&self, entry: DeletionPendingEntry);
    async fn pending(&self, store: StoreId) -> Vec<DeletionPendingEntry>;
    async fn pending_for_job(&self, job: JobId) -> Vec<DeletionPendingEntry>;
    async fn pending_count(&self, store: StoreId) -> usize;
    async fn remove_pending(&self, job: JobId, chunk: ChunkId) -> Option<DeletionPendingEntry>;
    /// Remove every entry for a chunk; returns the removed entries
    async fn remove_pending_for_chunk(&self, chunk: ChunkId) -> Vec<DeletionPendingEntry>;

    async fn add_drop(&self, entry: ChunkDropEntry);
    async fn drops(&self, store: Option<StoreId>) -> Vec<ChunkDropEntry>;
    async fn is_dropped(&self, chunk: ChunkId) -> bool;
    /// Clear every ledger entry for a chunk; returns how many were removed
    async fn clear_drops(&self, chunk: ChunkId) -> usize;

    async fn set_job_verification(&self, job: JobId, status: ArchCheckStatus);
    async fn job_verification(&self, job: JobId) -> ArchCheckStatus;

    async fn put_verification_job(&self, job: VerificationJob);
    async fn verification_job(&self, id: VerificationJobId) -> StorageResult<VerificationJob>;
    async fn verification_jobs(&self, store: Option<StoreId>) -> Vec<VerificationJob>;

    async fn record_prune_event(&self, event: PruneEvent);
    async fn prune_events(&self, store: StoreId) -> Vec<PruneEvent>;
    async fn pruning_phase_reached(&self, store: StoreId, phase: PrunePhase) -> bool;

    async fn raise_alert(&self, alert: Alert);
    async fn alerts(&self) -> Vec<Alert>;

    async fn set_next_backup_full(&self, subclient: SubclientId, flag: bool);
    async fn next_backup_full(&self, subclient: SubclientId) -> bool;
}

/// Serializable catalog contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogTables {
    pub next_job_id: u64,
    pub next_chunk_id: u64,
    pub next_verification_job_id: u64,
    pub jobs: BTreeMap<JobId, JobRecord>,
    pub chunks: BTreeMap<ChunkId, ChunkRecord>,
    /// `MMDeletedAF`, keyed by (job, chunk)
    #[serde(with = "pending_table")]
    pub pending: BTreeMap<(JobId, ChunkId), DeletionPendingEntry>,
    /// `archChunkDDBDrop`
    pub drops: Vec<ChunkDropEntry>,
    /// `JMJobDataStats.archCheckStatus`
    pub job_verification: BTreeMap<JobId, ArchCheckStatus>,
    pub verification_jobs: BTreeMap<VerificationJobId, VerificationJob>,
    pub prune_events: VecDeque<PruneEvent>,
    /// Phases each store has reached; survives trimming of `prune_events`
    #[serde(default)]
    pub phases_reached: BTreeSet<(StoreId, PrunePhase)>,
    pub alerts: VecDeque<Alert>,
    pub next_backup_full: BTreeSet<SubclientId>,
}

/// The pending table persists as a list of entries; tuple keys are not
/// valid JSON object keys.
mod pending_table {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        table: &BTreeMap<(JobId, ChunkId), DeletionPendingEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(table.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<(JobId, ChunkId), DeletionPendingEntry>, D::Error> {
        let entries = Vec::<DeletionPendingEntry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.key(), e)).collect())
    }
}

impl CatalogTables {
    /// Drop the oldest history rows beyond `limit`. Running verification
    /// jobs are never dropped.
    fn trim_history(&mut self, limit: usize) {
        cap(&mut self.prune_events, limit);
        cap(&mut self.alerts, limit);
        self.trim_verification_jobs(limit);
    }

    fn trim_verification_jobs(&mut self, limit: usize) {
        if self.verification_jobs.len() <= limit {
            return;
        }
        let finished: Vec<VerificationJobId> = self
            .verification_jobs
            .values()
            .filter(|j| j.finished_at.is_some())
            .map(|j| j.id)
            .collect();
        let excess = self.verification_jobs.len().saturating_sub(limit);
        for id in finished.into_iter().take(excess) {
            self.verification_jobs.remove(&id);
        }
    }
}

fn cap<T>(queue: &mut VecDeque<T>, limit: usize) {
    while queue.len() > limit {
        queue.pop_front();
    }
}

fn next_id(counter: &mut u64) -> u64 {
    *counter = (*counter).max(1);
    let id = *counter;
    *counter += 1;
    id
}

/// In-memory catalog
pub struct MemoryCatalog {
    tables: RwLock<CatalogTables>,
    history_limit: usize,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self {
            tables: RwLock::new(CatalogTables::default()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` prune events, alerts and finished
    /// verification jobs
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub async fn snapshot(&self) -> CatalogTables {
        self.tables.read().await.clone()
    }

    pub async fn restore(&self, mut tables: CatalogTables) {
        for event in &tables.prune_events {
            tables.phases_reached.insert((event.store, event.phase));
        }
        tables.trim_history(self.history_limit);
        *self.tables.write().await = tables;
    }
}

#[async_trait]
impl MetadataStore for MemoryCatalog {
    async fn allocate_job_id(&self) -> JobId {
        JobId(next_id(&mut self.tables.write().await.next_job_id))
    }

    async fn allocate_chunk_id(&self) -> ChunkId {
        ChunkId(next_id(&mut self.tables.write().await.next_chunk_id))
    }

    async fn allocate_verification_job_id(&self) -> VerificationJobId {
        VerificationJobId(next_id(
            &mut self.tables.write().await.next_verification_job_id,
        ))
    }

    async fn put_job(&self, job: JobRecord) {
        self.tables.write().await.jobs.insert(job.id, job);
    }

    async fn job(&self, id: JobId) -> StorageResult<JobRecord> {
        self.tables
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StorageError::JobNotFound(id))
    }

    async fn jobs(&self, store: Option<StoreId>) -> Vec<JobRecord> {
        self.tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| store.map_or(true, |s| j.store == s))
            .cloned()
            .collect()
    }

    async fn put_chunk(&self, chunk: ChunkRecord) {
        self.tables.write().await.chunks.insert(chunk.id, chunk);
    }

    async fn chunk(&self, id: ChunkId) -> Option<ChunkRecord> {
        self.tables.read().await.chunks.get(&id).cloned()
    }

    async fn chunks(&self, store: StoreId) -> Vec<ChunkRecord> {
        self.tables
            .read()
            .await
            .chunks
            .values()
            .filter(|c| c.store == store)
            .cloned()
            .collect()
    }

    async fn remove_chunk(&self, id: ChunkId) -> Option<ChunkRecord> {
        self.tables.write().await.chunks.remove(&id)
    }

    async fn mark_chunk_verified(&self, id: ChunkId, at: DateTime<Utc>) {
        if let Some(chunk) = self.tables.write().await.chunks.get_mut(&id) {
            chunk.last_verified = Some(at);
        }
    }

    async fn put_pending(&self, entry: DeletionPendingEntry) {
        self.tables.write().await.pending.insert(entry.key(), entry);
    }

    async fn pending(&self, store: StoreId) -> Vec<DeletionPendingEntry> {
        self.tables
            .read()
            .await
            .pending
            .values()
            .filter(|e| e.store == store)
            .cloned()
            .collect()
    }

    async fn pending_for_job(&self, job: JobId) -> Vec<DeletionPendingEntry> {
        self.tables
            .read()
            .await
            .pending
            .range((job, ChunkId(0))..=(job, ChunkId(u64::MAX)))
            .map(|(_, e)| e.clone())
            .collect()
    }

    async fn pending_count(&self, store: StoreId) -> usize {
        self.tables
            .read()
            .await
            .pending
            .values()
            .filter(|e| e.store == store)
            .count()
    }

    async fn remove_pending(&self, job: JobId, chunk: ChunkId) -> Option<DeletionPendingEntry> {
        self.tables.write().await.pending.remove(&(job, chunk))
    }

    async fn remove_pending_for_chunk(&self, chunk: ChunkId) -> Vec<DeletionPendingEntry> {
        let mut tables = self.tables.write().await;
        let keys: Vec<_> = tables
            .pending
            .keys()
            .filter(|(_, c)| *c == chunk)
            .copied()
            .collect();
        keys.iter()
            .filter_map(|key| tables.pending.remove(key))
            .collect()
    }

    async fn add_drop(&self, entry: ChunkDropEntry) {
        let mut tables = self.tables.write().await;
        let exists = tables.drops.iter().any(|d| {
            d.store == entry.store
                && d.verification_job == entry.verification_job
                && d.chunk == entry.chunk
        });
        if !exists {
            tables.drops.push(entry);
        }
    }

    async fn drops(&self, store: Option<StoreId>) -> Vec<ChunkDropEntry> {
        self.tables
            .read()
            .await
            .drops
            .iter()
            .filter(|d| store.map_or(true, |s| d.store == s))
            .cloned()
            .collect()
    }

    async fn is_dropped(&self, chunk: ChunkId) -> bool {
        self.tables.read().await.drops.iter().any(|d| d.chunk == chunk)
    }

    async fn clear_drops(&self, chunk: ChunkId) -> usize {
        let mut tables = self.tables.write().await;
        let before = tables.drops.len();
        tables.drops.retain(|d| d.chunk != chunk);
        before - tables.drops.len()
    }

    async fn set_job_verification(&self, job: JobId, status: ArchCheckStatus) {
        self.tables
            .write()
            .await
            .job_verification
            .insert(job, status);
    }

    async fn job_verification(&self, job: JobId) -> ArchCheckStatus {
        self.tables
            .read()
            .await
            .job_verification
            .get(&job)
            .copied()
            .unwrap_or(ArchCheckStatus::NotVerified)
    }

    async fn put_verification_job(&self, job: VerificationJob) {
        let mut tables = self.tables.write().await;
        tables.verification_jobs.insert(job.id, job);
        tables.trim_verification_jobs(self.history_limit);
    }

    async fn verification_job(&self, id: VerificationJobId) -> StorageResult<VerificationJob> {
        self.tables
            .read()
            .await
            .verification_jobs
            .get(&id)
            .cloned()
            .ok_or(StorageError::VerificationJobNotFound(id))
    }

    async fn verification_jobs(&self, store: Option<StoreId>) -> Vec<VerificationJob> {
        self.tables
            .read()
            .await
            .verification_jobs
            .values()
            .filter(|j| store.map_or(true, |s| j.store == s))
            .cloned()
            .collect()
    }

    async fn record_prune_event(&self, event: PruneEvent) {
        let mut tables = self.tables.write().await;
        tables.phases_reached.insert((event.store, event.phase));
        tables.prune_events.push_back(event);
        cap(&mut tables.prune_events, self.history_limit);
    }

    async fn prune_events(&self, store: StoreId) -> Vec<PruneEvent> {
        self.tables
            .read()
            .await
            .prune_events
            .iter()
            .filter(|e| e.store == store)
            .cloned()
            .collect()
    }

    async fn pruning_phase_reached(&self, store: StoreId, phase: PrunePhase) -> bool {
        self.tables
            .read()
            .await
            .phases_reached
            .contains(&(store, phase))
    }

    async fn raise_alert(&self, alert: Alert) {
        let mut tables = self.tables.write().await;
        tables.alerts.push_back(alert);
        cap(&mut tables.alerts, self.history_limit);
    }

    async fn alerts(&self) -> Vec<Alert> {
        self.tables.read().await.alerts.iter().cloned().collect()
    }

    async fn set_next_backup_full(&self, subclient: SubclientId, flag: bool) {
        let mut tables = self.tables.write().await;
        if flag {
            tables.next_backup_full.insert(subclient);
        } else {
            tables.next_backup_full.remove(&subclient);
        }
    }

    async fn next_backup_full(&self, subclient: SubclientId) -> bool {
        self.tables
            .read()
            .await
            .next_backup_full
            .contains(&subclient)
    }
}
