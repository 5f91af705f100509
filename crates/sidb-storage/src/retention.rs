//! Retention and explicit job deletion
//!
//! Deleting a job never touches reference counts directly: it stages one
//! deletion-pending entry per (job, chunk) carrying the references the job
//! made into that chunk. The pruning engine releases them later.

use chrono::{DateTime, Duration, Utc};
use sidb_core::{
    Config, DeletionPendingEntry, JobId, JobRecord, JobStatus, RetentionRule, SignatureRef,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::catalog::MetadataStore;
use crate::dedup::DedupStore;
use crate::error::{StorageError, StorageResult};

/// Data aging result
#[derive(Debug, Clone, Default)]
pub struct AgingResult {
    /// Completed, live jobs considered
    pub jobs_examined: u64,
    /// Jobs deleted by the retention rule
    pub jobs_aged: u64,
    /// Deletion-pending entries created
    pub entries_staged: u64,
    /// Errors encountered
    pub errors: Vec<String>,
}

pub struct RetentionEngine {
    catalog: Arc<dyn MetadataStore>,
    dedup: Arc<DedupStore>,
    config: Arc<RwLock<Config>>,
}

impl RetentionEngine {
    pub fn new(
        catalog: Arc<dyn MetadataStore>,
        dedup: Arc<DedupStore>,
        config: Arc<RwLock<Config>>,
    ) -> Self {
        Self {
            catalog,
            dedup,
            config,
        }
    }

    /// Delete a job and stage its chunks for pruning.
    ///
    /// Returns the number of entries staged; deleting an already deleted
    /// job stages nothing.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, id: JobId) -> StorageResult<usize> {
        let mut job = self.catalog.job(id).await?;
        if !job.status.is_finished() {
            return Err(StorageError::InvalidState(format!(
                "job {} is still running",
                id
            )));
        }
        if job.is_deleted() {
            debug!("Job {} already deleted", id);
            return Ok(0);
        }

        let entries = self.stage_entries(&job).await?;
        let staged = entries.len();
        for entry in entries {
            self.catalog.put_pending(entry).await;
        }

        job.deleted_at = Some(Utc::now());
        self.catalog.put_job(job).await;
        info!("Deleted job {}, staged {} chunk entries", id, staged);
        Ok(staged)
    }

    /// One entry per chunk the job depends on, carrying exactly the
    /// increments the job made against that chunk
    async fn stage_entries(&self, job: &JobRecord) -> StorageResult<Vec<DeletionPendingEntry>> {
        let mut by_chunk: BTreeMap<_, Vec<SignatureRef>> = BTreeMap::new();
        for chunk in job.chunks() {
            by_chunk.insert(chunk, Vec::new());
        }
        for r in &job.references {
            by_chunk.entry(r.chunk).or_default().push(*r);
        }

        let mut entries = Vec::with_capacity(by_chunk.len());
        for (chunk, references) in by_chunk {
            let substore = match references.first() {
                Some(r) => r.substore,
                None => match self.catalog.chunk(chunk).await {
                    Some(record) => record.substore,
                    None => {
                        warn!("Job {} lists unknown chunk {} with no references", job.id, chunk);
                        continue;
                    }
                },
            };
            entries.push(DeletionPendingEntry::new(
                job.store, substore, chunk, job.id, references,
            ));
        }
        Ok(entries)
    }

    /// Apply the days-and-cycles rule of each store at `now`
    #[instrument(skip(self))]
    pub async fn run_data_aging(&self, now: DateTime<Utc>) -> StorageResult<AgingResult> {
        let config = self.config.read().await.clone();
        let mut result = AgingResult::default();

        for store in self.dedup.stores() {
            let rule = config.retention(store);
            let jobs = self.catalog.jobs(Some(store)).await;

            result.jobs_examined += jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed && !j.is_deleted())
                .count() as u64;

            for job in aged_jobs(&jobs, rule, now) {
                match self.delete_job(job).await {
                    Ok(staged) => {
                        result.jobs_aged += 1;
                        result.entries_staged += staged as u64;
                    }
                    Err(e) => {
                        warn!("Failed to age job {}: {}", job, e);
                        result.errors.push(format!("{}: {}", job, e));
                    }
                }
            }
        }

        info!(
            "Data aging: {} aged, {} entries staged",
            result.jobs_aged, result.entries_staged
        );
        Ok(result)
    }
}

/// Completed jobs older than `rule.days` with at least `rule.cycles`
/// newer full cycles on the same subclient
pub fn aged_jobs(jobs: &[JobRecord], rule: RetentionRule, now: DateTime<Utc>) -> Vec<JobId> {
    let cutoff = now - Duration::days(i64::from(rule.days));
    let live: Vec<&JobRecord> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Completed && !j.is_deleted())
        .collect();

    live.iter()
        .filter(|job| job.completed_at.unwrap_or(job.started_at) < cutoff)
        .filter(|job| {
            let newer_fulls = live
                .iter()
                .filter(|other| {
                    other.subclient == job.subclient
                        && other.level.is_full()
                        && other.started_at > job.started_at
                })
                .count();
            newer_fulls >= rule.cycles as usize
        })
        .map(|job| job.id)
        .collect()
}
