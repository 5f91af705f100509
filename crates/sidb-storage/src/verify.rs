//! DV2 verification
//!
//! Walks the chunks of a store and checks them against the catalog. A
//! missing or corrupted chunk is a recorded outcome, not an error: it goes
//! to the drop ledger and every job depending on it is marked bad.

use chrono::Utc;
use sidb_core::{
    ArchCheckStatus, CancelFlag, ChunkContainer, ChunkDropEntry, ChunkId, ChunkRecord, Config,
    JobId, JobRecord, StoreId, VerificationJob, VerificationJobId, VerificationState, VerifyDepth,
    VerifyScope,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ChunkLocation, ChunkStore};
use crate::catalog::MetadataStore;
use crate::dedup::DedupStore;
use crate::error::{StorageError, StorageResult};
use crate::leases::ChunkLeases;

/// Verification engine
pub struct VerificationEngine {
    catalog: Arc<dyn MetadataStore>,
    dedup: Arc<DedupStore>,
    chunks: Arc<dyn ChunkStore>,
    leases: ChunkLeases,
    config: Arc<RwLock<Config>>,
}

impl VerificationEngine {
    pub fn new(
        catalog: Arc<dyn MetadataStore>,
        dedup: Arc<DedupStore>,
        chunks: Arc<dyn ChunkStore>,
        leases: ChunkLeases,
        config: Arc<RwLock<Config>>,
    ) -> Self {
        Self {
            catalog,
            dedup,
            chunks,
            leases,
            config,
        }
    }

    /// Record a verification job in `Scheduled` state
    pub async fn schedule(
        &self,
        store: StoreId,
        scope: VerifyScope,
        depth: VerifyDepth,
    ) -> StorageResult<VerificationJobId> {
        self.dedup.store_info(store)?;
        let id = self.catalog.allocate_verification_job_id().await;
        self.catalog
            .put_verification_job(VerificationJob::new(id, store, scope, depth))
            .await;
        debug!("Scheduled verification job {} for store {}", id, store);
        Ok(id)
    }

    /// Schedule and run in one go
    pub async fn verify(
        &self,
        store: StoreId,
        scope: VerifyScope,
        depth: VerifyDepth,
        cancel: &CancelFlag,
    ) -> StorageResult<VerificationJob> {
        let id = self.schedule(store, scope, depth).await?;
        self.run(id, cancel).await
    }

    /// Run a scheduled verification job to completion or cancellation
    #[instrument(skip(self, cancel))]
    pub async fn run(
        &self,
        id: VerificationJobId,
        cancel: &CancelFlag,
    ) -> StorageResult<VerificationJob> {
        let mut job = self.catalog.verification_job(id).await?;
        if job.state != VerificationState::Scheduled {
            return Err(StorageError::InvalidState(format!(
                "verification job {} is {}",
                id,
                job.state.as_str()
            )));
        }
        let config = self.config.read().await.clone();

        job.state = VerificationState::Running;
        job.started_at = Some(Utc::now());
        self.catalog.put_verification_job(job.clone()).await;

        let candidates = self.select_chunks(&job, &config).await;
        info!(
            "Verification job {} ({:?}/{:?}) on store {}: {} chunks",
            id,
            job.scope,
            job.depth,
            job.store,
            candidates.len()
        );

        let dependents = self.dependents(job.store).await;
        let mut touched: BTreeSet<JobId> = BTreeSet::new();
        let mut cancelled = false;

        for chunk_id in candidates {
            if cancel.is_cancelled() {
                warn!("Verification job {} cancelled", id);
                cancelled = true;
                break;
            }

            // Holding the lease keeps physical pruning away from the chunk
            let Some(_lease) = self.leases.acquire_read(chunk_id) else {
                debug!("Chunk {} is being pruned, skipping", chunk_id);
                job.chunks_skipped += 1;
                continue;
            };
            let Some(chunk) = self.catalog.chunk(chunk_id).await else {
                debug!("Chunk {} pruned before verification, skipping", chunk_id);
                job.chunks_skipped += 1;
                continue;
            };
            job.chunks_examined += 1;

            let jobs = dependents.get(&chunk_id).cloned().unwrap_or_default();
            touched.extend(jobs.iter().map(|j| j.id));

            match self.check(&chunk, job.depth, &config).await {
                None => {
                    job.chunks_good += 1;
                    if self.catalog.clear_drops(chunk_id).await > 0 {
                        info!("Chunk {} verified good again, clearing drop entry", chunk_id);
                        job.chunks_repaired += 1;
                    }
                }
                Some(reason) => {
                    warn!("Chunk {} failed verification: {}", chunk_id, reason);
                    job.chunks_bad += 1;
                    self.catalog
                        .add_drop(ChunkDropEntry {
                            store: job.store,
                            verification_job: id,
                            chunk: chunk_id,
                            reason,
                            dropped_at: Utc::now(),
                        })
                        .await;
                    if config.mark_next_backup_full_on_dv_failure {
                        for dependent in &jobs {
                            self.catalog
                                .set_next_backup_full(dependent.subclient, true)
                                .await;
                        }
                    }
                }
            }
            self.catalog.mark_chunk_verified(chunk_id, Utc::now()).await;
        }

        self.update_job_status(&touched, &dependents).await;

        job.state = if cancelled {
            VerificationState::Killed
        } else if job.chunks_bad > 0 {
            VerificationState::CompletedWithErrors
        } else {
            VerificationState::Completed
        };
        job.finished_at = Some(Utc::now());
        self.catalog.put_verification_job(job.clone()).await;

        info!(
            "Verification job {} {}: {} good, {} bad, {} skipped, {} repaired",
            id,
            job.state.as_str(),
            job.chunks_good,
            job.chunks_bad,
            job.chunks_skipped,
            job.chunks_repaired
        );
        Ok(job)
    }

    async fn select_chunks(&self, job: &VerificationJob, config: &Config) -> Vec<ChunkId> {
        let mut selected = Vec::new();
        for chunk in self.catalog.chunks(job.store).await {
            let wanted = match job.scope {
                VerifyScope::Full => true,
                VerifyScope::Incremental => {
                    chunk.last_verified.is_none()
                        || (config.force_reverify && self.catalog.is_dropped(chunk.id).await)
                }
            };
            if wanted {
                selected.push(chunk.id);
            }
        }
        selected
    }

    /// Live jobs of a store keyed by the chunks they depend on
    async fn dependents(&self, store: StoreId) -> BTreeMap<ChunkId, Vec<JobRecord>> {
        let mut map: BTreeMap<ChunkId, Vec<JobRecord>> = BTreeMap::new();
        for job in self.catalog.jobs(Some(store)).await {
            if job.is_deleted() {
                continue;
            }
            for chunk in job.chunks() {
                map.entry(chunk).or_default().push(job.clone());
            }
        }
        map
    }

    /// `None` if the chunk is good, otherwise why it is bad
    async fn check(&self, chunk: &ChunkRecord, depth: VerifyDepth, config: &Config) -> Option<String> {
        match depth {
            VerifyDepth::Quick => {
                for signature in &chunk.signatures {
                    match self.dedup.locate(chunk.store, signature) {
                        Ok(Some(_)) => {}
                        Ok(None) => return Some(format!("signature {} not indexed", signature)),
                        Err(e) => return Some(e.to_string()),
                    }
                }
                if config.quick_verify_file_check {
                    match self.chunks.chunk_exists(&ChunkLocation::from(chunk)).await {
                        Ok(true) => {}
                        Ok(false) => return Some("chunk container missing".to_string()),
                        Err(e) => return Some(e.to_string()),
                    }
                }
                None
            }
            VerifyDepth::Complete => {
                let data = match self.chunks.read_chunk(&ChunkLocation::from(chunk)).await {
                    Ok(data) => data,
                    Err(StorageError::ChunkNotFound(_)) => {
                        return Some("chunk container missing".to_string())
                    }
                    Err(e) => return Some(e.to_string()),
                };
                match ChunkContainer::from_bytes(&data) {
                    Ok(container) if container.signatures() == chunk.signatures => None,
                    Ok(_) => Some("container signatures differ from catalog".to_string()),
                    Err(e) => Some(format!("corrupted: {}", e)),
                }
            }
        }
    }

    /// Good (5) when none of a job's chunks sit in the drop ledger, else bad (6)
    async fn update_job_status(
        &self,
        touched: &BTreeSet<JobId>,
        dependents: &BTreeMap<ChunkId, Vec<JobRecord>>,
    ) {
        for job_id in touched {
            let Some(job) = dependents
                .values()
                .flatten()
                .find(|j| j.id == *job_id)
            else {
                continue;
            };
            let mut status = ArchCheckStatus::Good;
            for chunk in job.chunks() {
                if self.catalog.is_dropped(chunk).await {
                    status = ArchCheckStatus::Bad;
                    break;
                }
            }
            self.catalog.set_job_verification(*job_id, status).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use sidb_core::{SubclientId, CONTAINER_FILE_NAME};

    async fn run(f: &Fixture, scope: VerifyScope, depth: VerifyDepth) -> VerificationJob {
        f.verifier()
            .verify(f.store, scope, depth, &CancelFlag::new())
            .await
            .unwrap()
    }

    fn container(f: &Fixture, chunk: &ChunkRecord) -> std::path::PathBuf {
        f.chunk_dir(chunk).join(CONTAINER_FILE_NAME)
    }

    #[tokio::test]
    async fn test_clean_store_verifies_good() {
        let f = Fixture::new();
        let (job, _) = f.backup(1, &["a", "b"]).await;
        let result = run(&f, VerifyScope::Full, VerifyDepth::Complete).await;
        assert_eq!(result.state, VerificationState::Completed);
        assert_eq!(result.chunks_good, 1);
        assert_eq!(f.catalog.job_verification(job).await.code(), 5);
    }

    #[tokio::test]
    async fn test_quick_detects_renamed_container() {
        let f = Fixture::new();
        let (job, chunk) = f.backup(1, &["a"]).await;
        let path = container(&f, &chunk);
        std::fs::rename(&path, path.with_extension("bak")).unwrap();

        let result = run(&f, VerifyScope::Incremental, VerifyDepth::Quick).await;
        assert_eq!(result.state, VerificationState::CompletedWithErrors);
        assert_eq!(result.state.as_str(), "Completed w/ one or more errors");
        assert_eq!(result.chunks_bad, 1);

        let drops = f.catalog.drops(Some(f.store)).await;
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].chunk, chunk.id);
        assert_eq!(drops[0].verification_job, result.id);
        assert_eq!(f.catalog.job_verification(job).await.code(), 6);
        assert!(f.catalog.next_backup_full(SubclientId(1)).await);
    }

    #[tokio::test]
    async fn test_quick_without_file_check_misses_missing_file() {
        let f = Fixture::new();
        f.config.write().await.quick_verify_file_check = false;
        let (_, chunk) = f.backup(1, &["a"]).await;
        std::fs::remove_file(container(&f, &chunk)).unwrap();

        let result = run(&f, VerifyScope::Full, VerifyDepth::Quick).await;
        assert_eq!(result.state, VerificationState::Completed);
        assert!(f.catalog.drops(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_force_reverify_repairs_dependents() {
        let f = Fixture::new();
        let (full, chunk) = f.backup(1, &["a"]).await;
        let incr = f.dedup_backup(2, &chunk).await;
        let path = container(&f, &chunk);
        let renamed = path.with_extension("bak");
        std::fs::rename(&path, &renamed).unwrap();

        run(&f, VerifyScope::Incremental, VerifyDepth::Quick).await;
        assert_eq!(f.catalog.job_verification(full).await.code(), 6);
        assert_eq!(f.catalog.job_verification(incr).await.code(), 6);

        std::fs::rename(&renamed, &path).unwrap();

        // Already verified: a plain incremental leaves the chunk alone
        let result = run(&f, VerifyScope::Incremental, VerifyDepth::Quick).await;
        assert_eq!(result.chunks_examined, 0);
        assert_eq!(f.catalog.drops(None).await.len(), 1);

        f.config.write().await.force_reverify = true;
        let result = run(&f, VerifyScope::Incremental, VerifyDepth::Quick).await;
        assert_eq!(result.state, VerificationState::Completed);
        assert_eq!(result.chunks_repaired, 1);
        assert!(f.catalog.drops(None).await.is_empty());
        assert_eq!(f.catalog.job_verification(full).await.code(), 5);
        assert_eq!(f.catalog.job_verification(incr).await.code(), 5);
    }

    #[tokio::test]
    async fn test_complete_detects_corruption() {
        let f = Fixture::new();
        let (job, chunk) = f.backup(1, &["a", "b"]).await;
        let path = container(&f, &chunk);
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        // Quick only sees the file is there
        let quick = run(&f, VerifyScope::Full, VerifyDepth::Quick).await;
        assert_eq!(quick.chunks_bad, 0);

        let complete = run(&f, VerifyScope::Full, VerifyDepth::Complete).await;
        assert_eq!(complete.chunks_bad, 1);
        assert!(f.catalog.drops(None).await[0].reason.starts_with("corrupted"));
        assert_eq!(f.catalog.job_verification(job).await, ArchCheckStatus::Bad);
    }

    #[tokio::test]
    async fn test_promotion_flag_respects_config() {
        let f = Fixture::new();
        f.config.write().await.mark_next_backup_full_on_dv_failure = false;
        let (_, chunk) = f.backup(1, &["a"]).await;
        std::fs::remove_file(container(&f, &chunk)).unwrap();

        run(&f, VerifyScope::Full, VerifyDepth::Quick).await;
        assert!(!f.catalog.next_backup_full(SubclientId(1)).await);
    }

    #[tokio::test]
    async fn test_chunk_being_deleted_is_skipped() {
        let f = Fixture::new();
        let (_, chunk) = f.backup(1, &["a"]).await;
        let lease = f.leases.begin_delete(chunk.id).unwrap();

        let result = run(&f, VerifyScope::Full, VerifyDepth::Complete).await;
        assert_eq!(result.state, VerificationState::Completed);
        assert_eq!(result.chunks_skipped, 1);
        assert_eq!(result.chunks_examined, 0);
        drop(lease);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_killed() {
        let f = Fixture::new();
        f.backup(1, &["a"]).await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let verifier = f.verifier();
        let result = verifier
            .verify(f.store, VerifyScope::Full, VerifyDepth::Complete, &cancel)
            .await
            .unwrap();
        assert_eq!(result.state, VerificationState::Killed);
        assert_eq!(result.chunks_examined, 0);

        // A finished job cannot run again
        assert!(verifier.run(result.id, &CancelFlag::new()).await.is_err());
    }
}
