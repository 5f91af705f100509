//! End-to-end pruning and verification scenarios through the engine facade

use bytes::Bytes;
use sidb_core::{
    BackupLevel, CancelFlag, ChunkId, Config, JobId, JobStatus, MountPathId, PendingStatus,
    PrunePhase, Signature, StoreId, SubclientId, SubstoreId, VerificationState, VerifyDepth,
    VerifyScope, VolumeId, CONTAINER_FILE_NAME,
};
use sidb_engine::{Engine, EngineConfig};
use sidb_storage::{PruneOptions, StorageError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    engine: Engine,
    store: StoreId,
    substore: SubstoreId,
    mount_path: MountPathId,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(Config::default().with_delete_backoff_ms(1)).await
    }

    async fn with_settings(settings: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default()
            .with_store("S", "/ddb/p1")
            .with_settings(settings);
        let engine = Engine::new(config).await.unwrap();
        let mount_path = engine.add_mount_path("M", dir.path());
        let store = engine.stores()[0];
        let substore = engine.dedup().substores(store).unwrap()[0];
        Self {
            _dir: dir,
            engine,
            store,
            substore,
            mount_path,
        }
    }

    /// Run a completed backup and return its job and the chunk it wrote
    async fn backup(&self, subclient: u64, level: BackupLevel, items: &[&str]) -> (JobId, Option<ChunkId>) {
        let job = self
            .engine
            .begin_backup(SubclientId(subclient), self.store, level)
            .await
            .unwrap();
        let payloads = items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect();
        let out = self
            .engine
            .write_chunk(job.id, VolumeId(1), self.mount_path, payloads)
            .await
            .unwrap();
        self.engine.on_job_completed(job.id, &[], &[]).await.unwrap();
        (job.id, out.chunk)
    }

    async fn container(&self, job: JobId) -> PathBuf {
        let paths = self.engine.chunks_for_job(job).await.unwrap();
        paths[0].path.join(CONTAINER_FILE_NAME)
    }

    fn zero_refs(&self) -> u64 {
        self.engine
            .get_zero_ref_count(self.store, self.substore)
            .unwrap()
    }

    async fn pending(&self) -> usize {
        self.engine
            .get_deletion_pending_count(self.store)
            .await
            .unwrap()
    }

    async fn prune(&self) -> sidb_storage::PruneCycleResult {
        self.engine
            .run_pruning(self.store, &PruneOptions::default())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn scenario_a_deleted_job_is_reclaimed() {
    let h = Harness::new().await;
    let (job, chunk) = h.backup(1, BackupLevel::Full, &["sig-1"]).await;
    let chunk = chunk.unwrap();
    let container = h.container(job).await;
    assert!(container.exists());

    let sig = Signature::from_data(b"sig-1");
    assert_eq!(h.engine.dedup().reference_count(h.store, &sig).unwrap(), 1);

    h.engine.on_job_deleted(job).await.unwrap();
    assert_eq!(h.pending().await, 1);

    let logical = h.engine.run_logical_pruning(h.store).await.unwrap();
    assert_eq!(logical.references_released, 1);
    assert_eq!(h.zero_refs(), 1);
    assert!(h.engine.pruning_phase_reached(h.store, PrunePhase::ReferencesReleased).await);

    let physical = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(physical.chunks_deleted, 1);
    assert!(!container.exists());
    assert!(!h.engine.is_chunk_present(chunk).await.unwrap());
    assert_eq!(h.pending().await, 0);
    assert!(h.engine.pruning_phase_reached(h.store, PrunePhase::JobPruned).await);
    assert!(h.engine.pruning_phase_reached(h.store, PrunePhase::ChunkFinalized).await);
}

#[tokio::test]
async fn scenario_b_offline_mount_path_blocks_pruning() {
    let h = Harness::new().await;
    let (job, chunk) = h.backup(1, BackupLevel::Full, &["x", "y"]).await;
    let chunk = chunk.unwrap();
    let container = h.container(job).await;

    h.engine.set_mount_path_online(h.mount_path, false).unwrap();
    h.engine.on_job_deleted(job).await.unwrap();

    let zero_refs = h.zero_refs();
    for _ in 0..3 {
        let cycle = h.prune().await;
        assert_eq!(cycle.logical.entries_blocked, 1);
        assert_eq!(cycle.physical.chunks_deleted, 0);
        assert_eq!(h.zero_refs(), zero_refs);
        assert_eq!(h.pending().await, 1);
    }
    assert!(container.exists());
    let pending = h.engine.deletion_pending(h.store).await.unwrap();
    assert_eq!(pending[0].status, PendingStatus::BlockedOffline);

    // Back online the entry resumes from where it stopped
    h.engine.set_mount_path_online(h.mount_path, true).unwrap();
    let cycle = h.prune().await;
    assert_eq!(cycle.physical.chunks_deleted, 1);
    assert_eq!(h.pending().await, 0);
    assert!(!h.engine.is_chunk_present(chunk).await.unwrap());
}

#[tokio::test]
async fn scenarios_c_d_e_verification_failure_and_repair() {
    let h = Harness::new().await;
    let (original, chunk) = h.backup(1, BackupLevel::Full, &["v"]).await;
    let chunk = chunk.unwrap();
    // A second subclient deduplicates into the same chunk
    let (dependent, new_chunk) = h.backup(2, BackupLevel::Full, &["v"]).await;
    assert!(new_chunk.is_none());

    let container = h.container(original).await;
    let moved = container.with_extension("moved");
    std::fs::rename(&container, &moved).unwrap();

    // C: quick verification with the file check notices the missing file
    let job = h
        .engine
        .run_verification(h.store, VerifyScope::Incremental, VerifyDepth::Quick)
        .await
        .unwrap();
    assert_eq!(job.state, VerificationState::CompletedWithErrors);
    let drops = h.engine.bad_chunks(Some(h.store), Some(job.id)).await;
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].chunk, chunk);
    assert_eq!(
        h.engine.get_chunk_verification_status(original).await.unwrap().code(),
        6
    );
    assert_eq!(
        h.engine.get_chunk_verification_status(dependent).await.unwrap().code(),
        6
    );

    // E: the subclient's next incremental is promoted to full
    let promoted = h
        .engine
        .begin_backup(SubclientId(1), h.store, BackupLevel::Incremental)
        .await
        .unwrap();
    assert_eq!(promoted.level, BackupLevel::Full);
    assert_eq!(promoted.level.as_str(), "Full");
    assert_eq!(promoted.requested_level, BackupLevel::Incremental);
    h.engine.on_job_completed(promoted.id, &[], &[]).await.unwrap();
    assert!(!h.engine.next_backup_full(SubclientId(1)).await);

    // D: repair outside the product, force re-verification
    std::fs::rename(&moved, &container).unwrap();
    let settings = h.engine.settings().await.with_force_reverify(true);
    h.engine.update_config(settings).await.unwrap();

    let job = h
        .engine
        .run_verification(h.store, VerifyScope::Incremental, VerifyDepth::Quick)
        .await
        .unwrap();
    assert_eq!(job.state, VerificationState::Completed);
    assert_eq!(job.chunks_repaired, 1);
    assert!(h.engine.bad_chunks(Some(h.store), None).await.is_empty());
    assert_eq!(
        h.engine.get_chunk_verification_status(original).await.unwrap().code(),
        5
    );
    assert_eq!(
        h.engine.get_chunk_verification_status(dependent).await.unwrap().code(),
        5
    );
}

#[tokio::test]
async fn quick_verification_without_file_check_misses_renamed_file() {
    let h = Harness::with_settings(
        Config::default()
            .with_delete_backoff_ms(1)
            .with_quick_verify_file_check(false),
    )
    .await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["q"]).await;
    let container = h.container(job).await;
    std::fs::rename(&container, container.with_extension("moved")).unwrap();

    let quick = h
        .engine
        .run_verification(h.store, VerifyScope::Full, VerifyDepth::Quick)
        .await
        .unwrap();
    assert_eq!(quick.state, VerificationState::Completed);

    let complete = h
        .engine
        .run_verification(h.store, VerifyScope::Full, VerifyDepth::Complete)
        .await
        .unwrap();
    assert_eq!(complete.state, VerificationState::CompletedWithErrors);
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let h = Harness::new().await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["a", "b"]).await;
    h.engine.set_mount_path_pruning(h.mount_path, false).unwrap();
    h.engine.on_job_deleted(job).await.unwrap();

    let first = h.prune().await;
    assert_eq!(first.logical.signatures_confirmed, 2);
    assert_eq!(first.physical.held, 1);
    let zero_refs = h.zero_refs();
    assert_eq!(zero_refs, 2);

    let second = h.prune().await;
    assert_eq!(second.logical.references_released, 0);
    assert_eq!(second.logical.signatures_confirmed, 0);
    assert_eq!(h.zero_refs(), zero_refs);
    assert_eq!(h.pending().await, 1);
}

#[tokio::test]
async fn rewrite_after_sweep_keeps_chunk() {
    let h = Harness::new().await;
    let (job, chunk) = h.backup(1, BackupLevel::Full, &["shared"]).await;
    let chunk = chunk.unwrap();
    h.engine.on_job_deleted(job).await.unwrap();
    h.engine.run_logical_pruning(h.store).await.unwrap();
    assert_eq!(h.zero_refs(), 1);

    // An incoming backup carries the same content before physical pruning
    let (_, written) = h.backup(1, BackupLevel::Incremental, &["shared"]).await;
    assert!(written.is_none());
    assert_eq!(h.zero_refs(), 0);

    let physical = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(physical.chunks_deleted, 0);
    assert_eq!(physical.resurrected, 1);
    assert_eq!(h.pending().await, 0);
    assert!(h.engine.is_chunk_present(chunk).await.unwrap());
    assert_eq!(
        h.engine.restore_chunk(chunk).await.unwrap(),
        vec![Bytes::from_static(b"shared")]
    );
}

#[tokio::test]
async fn busy_reader_defers_physical_delete() {
    let h = Harness::new().await;
    let (job, chunk) = h.backup(1, BackupLevel::Full, &["r"]).await;
    let chunk = chunk.unwrap();
    h.engine.on_job_deleted(job).await.unwrap();
    h.engine.run_logical_pruning(h.store).await.unwrap();

    let lease = h.engine.leases().acquire_read(chunk).unwrap();
    let physical = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(physical.busy, 1);
    assert_eq!(physical.chunks_deleted, 0);
    assert!(h.engine.is_chunk_present(chunk).await.unwrap());
    assert_eq!(h.zero_refs(), 1);

    drop(lease);
    let physical = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(physical.chunks_deleted, 1);
    assert_eq!(h.pending().await, 0);
}

#[tokio::test]
async fn cancelled_sweep_keeps_entries_staged() {
    let h = Harness::new().await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["c1", "c2"]).await;
    h.engine.on_job_deleted(job).await.unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let result = h.engine.pruner().run_logical(h.store, &cancel).await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.references_released, 0);

    let pending = h.engine.deletion_pending(h.store).await.unwrap();
    assert_eq!(pending[0].status, PendingStatus::LogicalPruneStaged);
    let sig = Signature::from_data(b"c1");
    assert_eq!(h.engine.dedup().reference_count(h.store, &sig).unwrap(), 1);
}

#[tokio::test]
async fn persistent_delete_failure_raises_alert() {
    let h = Harness::new().await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["gone"]).await;
    let folder = h.engine.chunks_for_job(job).await.unwrap()[0].path.clone();
    h.engine.on_job_deleted(job).await.unwrap();
    h.engine.run_logical_pruning(h.store).await.unwrap();

    std::fs::remove_dir_all(&folder).unwrap();
    let physical = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(physical.delete_failures, 1);
    assert_eq!(h.pending().await, 1);
    assert_eq!(
        h.engine.deletion_pending(h.store).await.unwrap()[0].status,
        PendingStatus::DeleteFailed
    );

    let alerts = h.engine.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].attempts, 3);
    // Index entries survive the failed delete
    assert_eq!(h.zero_refs(), 1);

    // Failed entries wait for an explicit retry
    let again = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(again.chunks_examined, 0);
    assert_eq!(h.engine.retry_failed_deletes(h.store).await.unwrap(), 1);
    let retried = h
        .engine
        .run_physical_pruning(h.store, &PruneOptions::default())
        .await
        .unwrap();
    assert_eq!(retried.delete_failures, 1);
    assert_eq!(h.engine.alerts().await.len(), 2);
}

#[tokio::test]
async fn failed_backup_is_pruned() {
    let h = Harness::new().await;
    let job = h
        .engine
        .begin_backup(SubclientId(1), h.store, BackupLevel::Full)
        .await
        .unwrap();
    let out = h
        .engine
        .write_chunk(job.id, VolumeId(1), h.mount_path, vec![Bytes::from_static(b"partial")])
        .await
        .unwrap();
    h.engine.on_job_failed(job.id, JobStatus::Failed).await.unwrap();

    h.prune().await;
    assert_eq!(h.pending().await, 0);
    assert!(!h.engine.is_chunk_present(out.chunk.unwrap()).await.unwrap());
    assert_eq!(h.engine.primary_record_count(h.store).unwrap(), 0);
}

#[tokio::test]
async fn sealed_store_still_prunes() {
    let h = Harness::new().await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["s"]).await;
    h.engine.seal_store(h.store).unwrap();

    assert!(matches!(
        h.engine
            .begin_backup(SubclientId(1), h.store, BackupLevel::Full)
            .await,
        Err(StorageError::StoreSealed(_))
    ));

    h.engine.on_job_deleted(job).await.unwrap();
    let cycle = h.prune().await;
    assert_eq!(cycle.physical.chunks_deleted, 1);
    assert_eq!(h.pending().await, 0);
}

#[tokio::test]
async fn store_pruning_disabled_skips_physical_phase() {
    let h = Harness::new().await;
    let (job, _) = h.backup(1, BackupLevel::Full, &["p"]).await;
    h.engine.set_store_pruning(h.store, false).await.unwrap();
    h.engine.on_job_deleted(job).await.unwrap();

    let cycle = h.prune().await;
    assert!(cycle.physical.skipped);
    assert_eq!(h.zero_refs(), 1);
    assert_eq!(h.pending().await, 1);

    h.engine.set_store_pruning(h.store, true).await.unwrap();
    let cycle = h.prune().await;
    assert_eq!(cycle.physical.chunks_deleted, 1);
}

#[tokio::test]
async fn shared_content_survives_one_deletion() {
    let h = Harness::new().await;
    let (first, chunk) = h.backup(1, BackupLevel::Full, &["a", "b"]).await;
    let chunk = chunk.unwrap();
    let (second, _) = h.backup(2, BackupLevel::Full, &["a", "b"]).await;

    h.engine.on_job_deleted(first).await.unwrap();
    let cycle = h.prune().await;
    assert_eq!(cycle.logical.references_released, 2);
    assert_eq!(cycle.logical.entries_released, 1);
    assert_eq!(cycle.physical.chunks_deleted, 0);
    assert_eq!(h.zero_refs(), 0);
    assert!(h.engine.is_chunk_present(chunk).await.unwrap());

    h.engine.on_job_deleted(second).await.unwrap();
    let cycle = h.prune().await;
    assert_eq!(cycle.physical.chunks_deleted, 1);
    assert_eq!(h.engine.primary_record_count(h.store).unwrap(), 0);
}

#[tokio::test]
async fn pruning_runs_are_recorded_as_tasks() {
    let h = Harness::new().await;
    h.prune().await;
    h.engine
        .run_verification(h.store, VerifyScope::Full, VerifyDepth::Quick)
        .await
        .unwrap();

    let tasks = h.engine.list_tasks(Some(false)).await;
    assert_eq!(tasks.len(), 2);
    assert!(tasks
        .iter()
        .all(|t| t.exitstatus.as_deref() == Some("OK")));
    assert!(h.engine.metrics().export().contains("sidb_sweep_runs_total"));
}

#[tokio::test]
async fn unknown_store_is_structural_error() {
    let h = Harness::new().await;
    assert!(matches!(
        h.engine.run_pruning(StoreId(42), &PruneOptions::default()).await,
        Err(StorageError::StoreNotFound(_))
    ));
    assert!(matches!(
        h.engine.get_zero_ref_count(h.store, SubstoreId(42)),
        Err(StorageError::SubstoreNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_backups_and_pruning_keep_counts_consistent() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default()
        .with_store("S", "/ddb/p1")
        .with_settings(Config::default().with_delete_backoff_ms(1));
    let engine = Arc::new(Engine::new(config).await.unwrap());
    let mount_path = engine.add_mount_path("M", dir.path());
    let store = engine.stores()[0];
    let stop = Arc::new(AtomicBool::new(false));

    let pruner = {
        let engine = engine.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut cycles = 0u32;
            while !stop.load(Ordering::SeqCst) {
                let cycle = engine
                    .run_pruning(store, &PruneOptions::default())
                    .await
                    .unwrap();
                assert!(cycle.physical.errors.is_empty(), "{:?}", cycle.physical.errors);
                cycles += 1;
                tokio::task::yield_now().await;
            }
            cycles
        })
    };

    // Every subclient deletes its previous backup after the next one
    // completes, so shared content keeps crossing zero while others
    // deduplicate against it
    let mut writers = Vec::new();
    for subclient in 1..=4u64 {
        let engine = engine.clone();
        writers.push(tokio::spawn(async move {
            let mut jobs = Vec::new();
            let mut previous: Option<JobId> = None;
            for round in 0..6u64 {
                let job = engine
                    .begin_backup(SubclientId(subclient), store, BackupLevel::Full)
                    .await
                    .unwrap();
                let payloads = vec![
                    Bytes::from_static(b"shared"),
                    Bytes::from(format!("rotating-{}", round % 3)),
                    Bytes::from(format!("own-{}-{}", subclient, round)),
                ];
                engine
                    .write_chunk(job.id, VolumeId(subclient), mount_path, payloads)
                    .await
                    .unwrap();
                engine.on_job_completed(job.id, &[], &[]).await.unwrap();
                if let Some(old) = previous.replace(job.id) {
                    engine.on_job_deleted(old).await.unwrap();
                }
                jobs.push(job.id);
            }
            jobs
        }));
    }

    let mut jobs = Vec::new();
    for writer in writers {
        jobs.extend(writer.await.unwrap());
    }
    stop.store(true, Ordering::SeqCst);
    assert!(pruner.await.unwrap() > 0);
    for _ in 0..3 {
        engine
            .run_pruning(store, &PruneOptions::default())
            .await
            .unwrap();
    }

    // Each count is what live jobs and unreleased entries still hold
    let mut expected: HashMap<Signature, u64> = HashMap::new();
    let mut live = Vec::new();
    for job in jobs {
        let record = engine.job(job).await.unwrap();
        if record.is_deleted() {
            continue;
        }
        for r in &record.references {
            *expected.entry(r.signature).or_default() += 1;
        }
        live.push(record);
    }
    for entry in engine.deletion_pending(store).await.unwrap() {
        if !entry.logical_done {
            for r in &entry.references {
                *expected.entry(r.signature).or_default() += 1;
            }
        }
    }
    assert_eq!(live.len(), 4);
    for (signature, count) in &expected {
        assert_eq!(
            engine.dedup().reference_count(store, signature).unwrap(),
            *count,
            "reference count of {}",
            signature
        );
    }
    assert_eq!(
        engine.dedup().primary_record_count(store).unwrap(),
        expected.len() as u64
    );

    for record in &live {
        for chunk in record.chunks() {
            assert!(
                engine.restore_chunk(chunk).await.is_ok(),
                "chunk {} of live job {} was reclaimed",
                chunk,
                record.id
            );
        }
    }
}
