//! Engine facade
//!
//! Wires the storage engines together and exposes what the surrounding job
//! manager calls: backup and deletion callbacks, store administration, the
//! metadata queries, and on-demand pruning and verification runs.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sidb_core::{
    Alert, ArchCheckStatus, BackupLevel, ChunkContainer, ChunkDropEntry, ChunkId, ChunkRecord,
    Config, DeletionPendingEntry, JobId, JobRecord, JobStatus, MountPathId, PruneEvent,
    PrunePhase, Segment, Signature, SignatureRef, StoreId, SubclientId, SubstoreId,
    VerificationJob, VerificationJobId, VerifyDepth, VerifyScope, VolumeId,
};
use sidb_storage::{
    AccessType, AgingResult, ChunkLeases, ChunkLocation, ChunkReader, ChunkStore, ChunkWriter,
    DedupStore,
    LocalChunkStore, LogicalPruneResult, MemoryCatalog, MetadataStore, MountPathAvailability,
    PhysicalPruneResult, PruneCycleResult, PruneOptions, PruningEngine, Reclaimability,
    RetentionEngine,
    StorageError, StorageResult, StoreInfo, SubstoreStatus, VerificationEngine,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::persistence::{PersistenceConfig, PersistenceManager, StateData};
use crate::tasks::{TaskRegistry, TaskSnapshot, WorkerType};

/// What a `write_chunk` call did with its segments
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// New chunk holding the segments that were not deduplicated
    pub chunk: Option<ChunkId>,
    /// Unique segments written into the new chunk
    pub written: usize,
    /// Segments that referenced existing content instead
    pub deduplicated: usize,
}

/// Physical location of one of a job's chunks
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPath {
    pub chunk: ChunkId,
    pub volume: VolumeId,
    pub mount_path: MountPathId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubstoreSummary {
    pub id: SubstoreId,
    pub status: i32,
    pub zero_refs: u64,
    pub awaiting_sweep: u64,
}

/// Point-in-time view of a store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub info: StoreInfo,
    pub substores: Vec<SubstoreSummary>,
    pub pending_entries: usize,
    pub primary_records: u64,
    pub secondary_records: u64,
    pub bad_chunks: usize,
    /// Disk usage of the mount paths holding the store's chunks
    pub mount_paths: Vec<MountPathUsage>,
}

/// Chunk folders found on a mount path, across every store
#[derive(Debug, Clone, Serialize)]
pub struct MountPathUsage {
    pub id: MountPathId,
    pub online: bool,
    pub chunk_folders: u64,
    pub bytes: u64,
}

pub struct Engine {
    config: EngineConfig,
    settings: Arc<RwLock<Config>>,
    catalog: Arc<MemoryCatalog>,
    dedup: Arc<DedupStore>,
    mount_paths: Arc<MountPathAvailability>,
    chunks: Arc<dyn ChunkStore>,
    leases: ChunkLeases,
    retention: RetentionEngine,
    pruner: PruningEngine,
    verifier: VerificationEngine,
    tasks: TaskRegistry,
    metrics: Arc<Metrics>,
    persistence: Option<PersistenceManager>,
    /// One pruning run at a time
    prune_lock: Mutex<()>,
    /// Serializes record updates of one running job
    job_locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl Engine {
    /// Build the engine, loading persisted state when `data_dir` is set
    pub async fn new(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let settings = Arc::new(RwLock::new(config.settings.clone()));
        let catalog = Arc::new(MemoryCatalog::new());
        let dedup = Arc::new(DedupStore::new());
        let mount_paths = Arc::new(MountPathAvailability::new());
        let chunks: Arc<dyn ChunkStore> = Arc::new(LocalChunkStore::new(mount_paths.clone()));
        let leases = ChunkLeases::new();
        let tasks = TaskRegistry::new(config.node.clone());
        let metrics = Arc::new(Metrics::new(config.metrics.clone())?);

        let persistence = match &config.data_dir {
            Some(dir) => Some(PersistenceManager::new(PersistenceConfig::new(dir)).await?),
            None => None,
        };
        if let Some(persistence) = &persistence {
            if let Some(state) = persistence.load_state().await? {
                catalog.restore(state.catalog).await;
                dedup.restore(state.dedup);
                mount_paths.restore(state.mount_paths);
            }
            tasks.restore(persistence.load_tasks().await?).await;
        }

        if mount_paths.list().is_empty() {
            for mp in &config.mount_paths {
                mount_paths.add(&mp.name, &mp.path);
            }
        }
        if dedup.stores().is_empty() {
            for store in &config.stores {
                let id = dedup.create_store(&store.name);
                for partition in &store.partitions {
                    dedup.add_partition(id, &partition.path, &partition.media_agent, false)?;
                }
            }
        }

        let catalog_dyn: Arc<dyn MetadataStore> = catalog.clone();
        let retention = RetentionEngine::new(catalog_dyn.clone(), dedup.clone(), settings.clone());
        let pruner = PruningEngine::new(
            catalog_dyn.clone(),
            dedup.clone(),
            chunks.clone(),
            mount_paths.clone(),
            leases.clone(),
            settings.clone(),
        );
        let verifier = VerificationEngine::new(
            catalog_dyn,
            dedup.clone(),
            chunks.clone(),
            leases.clone(),
            settings.clone(),
        );

        info!(
            "Engine ready: {} stores, {} mount paths",
            dedup.stores().len(),
            mount_paths.list().len()
        );

        Ok(Self {
            config,
            settings,
            catalog,
            dedup,
            mount_paths,
            chunks,
            leases,
            retention,
            pruner,
            verifier,
            tasks,
            metrics,
            persistence,
            prune_lock: Mutex::new(()),
            job_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn leases(&self) -> &ChunkLeases {
        &self.leases
    }

    pub fn pruner(&self) -> &PruningEngine {
        &self.pruner
    }

    pub fn verifier(&self) -> &VerificationEngine {
        &self.verifier
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    /// Current registry settings
    pub async fn settings(&self) -> Config {
        self.settings.read().await.clone()
    }

    /// Replace the registry settings; runs already in progress keep the
    /// snapshot they started with
    pub async fn update_config(&self, settings: Config) -> sidb_core::Result<()> {
        settings.validate()?;
        *self.settings.write().await = settings;
        info!("Registry settings updated");
        Ok(())
    }

    // ---- store administration ----

    pub fn create_store(&self, name: &str) -> StoreId {
        self.dedup.create_store(name)
    }

    pub fn add_partition(
        &self,
        store: StoreId,
        path: &str,
        media_agent: &str,
        allow_path_reuse: bool,
    ) -> StorageResult<SubstoreId> {
        self.dedup
            .add_partition(store, path, media_agent, allow_path_reuse)
    }

    pub fn seal_store(&self, store: StoreId) -> StorageResult<()> {
        self.dedup.seal_store(store)
    }

    /// Take substores offline for recovery; all of the store's when `None`
    #[instrument(skip(self))]
    pub fn mark_substore_for_recovery(
        &self,
        store: StoreId,
        substores: Option<Vec<SubstoreId>>,
    ) -> StorageResult<Vec<SubstoreId>> {
        let targets = match substores {
            Some(list) => list,
            None => self.dedup.substores(store)?,
        };
        for substore in &targets {
            self.dedup
                .set_substore_status(store, *substore, SubstoreStatus::Offline)?;
        }
        warn!("Marked {} substores of store {} for recovery", targets.len(), store);
        Ok(targets)
    }

    /// Rebuild a substore's counts from the references still held: live
    /// jobs plus deletion entries whose references were not released yet
    #[instrument(skip(self))]
    pub async fn reconstruct_substore(
        &self,
        store: StoreId,
        substore: SubstoreId,
    ) -> StorageResult<()> {
        let (upid, _cancel) = self
            .tasks
            .create(WorkerType::Reconstruct, Some(store))
            .await;

        let mut counts: HashMap<Signature, (ChunkId, u64)> = HashMap::new();
        let mut add = |r: &SignatureRef| {
            if r.substore == substore {
                counts.entry(r.signature).or_insert((r.chunk, 0)).1 += 1;
            }
        };
        for job in self.catalog.jobs(Some(store)).await {
            if !job.is_deleted() {
                job.references.iter().for_each(&mut add);
            }
        }
        for entry in self.catalog.pending(store).await {
            if !entry.logical_done {
                entry.references.iter().for_each(&mut add);
            }
        }

        let signatures = counts.len();
        let result = self.dedup.rebuild_substore(store, substore, counts);
        self.close_task(&upid, &result, |_| {
            (format!("rebuilt {} signatures", signatures), 0)
        })
        .await;
        result
    }

    pub fn substore_status(
        &self,
        store: StoreId,
        substore: SubstoreId,
    ) -> StorageResult<SubstoreStatus> {
        self.dedup.substore_status(store, substore)
    }

    /// Per-store mark-and-sweep interval override
    pub async fn set_mark_and_sweep_interval(&self, store: StoreId, secs: u64) -> StorageResult<()> {
        self.dedup.store_info(store)?;
        self.settings.write().await.set_sweep_interval(store, secs)?;
        info!("Mark-and-sweep interval of store {} set to {}s", store, secs);
        Ok(())
    }

    pub async fn set_store_pruning(&self, store: StoreId, enabled: bool) -> StorageResult<()> {
        self.dedup.store_info(store)?;
        self.settings.write().await.store_mut(store).pruning_enabled = enabled;
        Ok(())
    }

    // ---- mount paths ----

    pub fn add_mount_path(&self, name: &str, root: impl AsRef<std::path::Path>) -> MountPathId {
        self.mount_paths.add(name, root)
    }

    pub fn set_mount_path_online(&self, id: MountPathId, online: bool) -> StorageResult<()> {
        self.mount_paths.set_online(id, online)
    }

    pub fn set_mount_path_access(&self, id: MountPathId, access: AccessType) -> StorageResult<()> {
        self.mount_paths.set_access(id, access)
    }

    pub fn set_mount_path_pruning(&self, id: MountPathId, enabled: bool) -> StorageResult<()> {
        self.mount_paths.set_pruning_enabled(id, enabled)
    }

    // ---- backup write path ----

    fn job_lock(&self, job: JobId) -> Arc<Mutex<()>> {
        self.job_locks.entry(job).or_default().clone()
    }

    /// Forget the lock of a job that left the running state
    fn release_job_lock(&self, job: JobId) {
        self.job_locks.remove(&job);
    }

    /// Register a running backup. An incremental or differential is
    /// promoted to full while the subclient is flagged after a failed
    /// verification.
    #[instrument(skip(self))]
    pub async fn begin_backup(
        &self,
        subclient: SubclientId,
        store: StoreId,
        requested: BackupLevel,
    ) -> StorageResult<JobRecord> {
        if self.dedup.is_sealed(store)? {
            return Err(StorageError::StoreSealed(store));
        }

        let mut level = requested;
        if !requested.is_full() && self.catalog.next_backup_full(subclient).await {
            info!(
                "Promoting {} backup of subclient {} to Full after verification failure",
                requested, subclient
            );
            level = BackupLevel::Full;
            self.metrics.record_promotion(store);
        }

        let id = self.catalog.allocate_job_id().await;
        let job = JobRecord::new(id, subclient, store, requested, level);
        self.catalog.put_job(job.clone()).await;
        debug!("Started {} job {}", level, id);
        Ok(job)
    }

    /// Write one chunk's worth of segments for a running job.
    ///
    /// Segments whose content is already indexed are referenced in place,
    /// even if their signature is waiting for reclaim; the rest go into a
    /// single new chunk on `mount_path`. References are taken immediately
    /// so pruning cannot reclaim content the job depends on.
    #[instrument(skip(self, payloads), fields(segments = payloads.len()))]
    pub async fn write_chunk(
        &self,
        job: JobId,
        volume: VolumeId,
        mount_path: MountPathId,
        payloads: Vec<Bytes>,
    ) -> StorageResult<WriteOutcome> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;
        let mut record = self.catalog.job(job).await?;
        if record.status.is_finished() {
            self.release_job_lock(job);
            return Err(StorageError::InvalidState(format!("job {} is not running", job)));
        }
        let store = record.store;
        if self.dedup.is_sealed(store)? {
            return Err(StorageError::StoreSealed(store));
        }
        self.mount_paths.check_writable(mount_path)?;

        let mut deduplicated: Vec<SignatureRef> = Vec::new();
        let mut segments: Vec<Segment> = Vec::new();
        let mut fresh: HashSet<Signature> = HashSet::new();
        // One entry per payload stored in the new chunk, duplicates included
        let mut fresh_refs: Vec<Signature> = Vec::new();

        for data in payloads {
            let signature = Signature::from_data(&data);
            if fresh.contains(&signature) {
                fresh_refs.push(signature);
                continue;
            }
            match self.reference_existing(store, &signature) {
                Ok(Some(r)) => {
                    deduplicated.push(r);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.rollback(store, &deduplicated);
                    return Err(e);
                }
            }
            fresh.insert(signature);
            fresh_refs.push(signature);
            segments.push(Segment::new(data));
        }

        let mut outcome = WriteOutcome {
            chunk: None,
            written: segments.len(),
            deduplicated: deduplicated.len(),
        };

        if !segments.is_empty() {
            match self
                .store_new_chunk(&record, volume, mount_path, segments, &fresh_refs)
                .await
            {
                Ok((chunk, refs)) => {
                    outcome.chunk = Some(chunk);
                    record.written_chunks.push(chunk);
                    record.references.extend(refs);
                }
                Err(e) => {
                    self.rollback(store, &deduplicated);
                    return Err(e);
                }
            }
        }

        record.references.extend(deduplicated);
        self.catalog.put_job(record).await;
        debug!(
            "Job {}: {} segments written, {} deduplicated",
            job, outcome.written, outcome.deduplicated
        );
        Ok(outcome)
    }

    /// Take a reference on indexed content; `None` if it is not indexed or
    /// was reclaimed between the lookup and the increment. The reference
    /// names the chunk the increment landed on.
    fn reference_existing(
        &self,
        store: StoreId,
        signature: &Signature,
    ) -> StorageResult<Option<SignatureRef>> {
        let Some((substore, _)) = self.dedup.locate(store, signature)? else {
            return Ok(None);
        };
        match self.dedup.increment_reference(store, substore, signature) {
            Ok(chunk) => Ok(Some(SignatureRef {
                substore,
                signature: *signature,
                chunk,
            })),
            Err(StorageError::SignatureNotIndexed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn store_new_chunk(
        &self,
        job: &JobRecord,
        volume: VolumeId,
        mount_path: MountPathId,
        segments: Vec<Segment>,
        fresh_refs: &[Signature],
    ) -> StorageResult<(ChunkId, Vec<SignatureRef>)> {
        let store = job.store;
        let chunk = self.catalog.allocate_chunk_id().await;

        let mut refs = Vec::with_capacity(fresh_refs.len());
        for signature in fresh_refs {
            refs.push(SignatureRef {
                substore: self.dedup.route(store, signature)?,
                signature: *signature,
                chunk,
            });
        }

        let container = ChunkContainer::new(segments, self.config.compress_chunks);
        let signatures = container.signatures();
        let data = Bytes::from(container.to_bytes()?);
        let location = ChunkLocation::new(mount_path, volume, chunk);
        let size = self.chunks.write_chunk(&location, data).await?;

        let record = ChunkRecord {
            id: chunk,
            volume,
            mount_path,
            store,
            substore: refs[0].substore,
            signatures,
            size,
            written_by: job.id,
            created_at: Utc::now(),
            last_verified: None,
        };

        if let Err(e) = self.dedup.commit_references(store, &refs) {
            // Another writer may have deduplicated against the chunk before
            // the rollback; it then stays as an ordinary chunk.
            match self
                .dedup
                .chunk_reclaimability(store, chunk, &record.signatures)
            {
                Ok(Reclaimability::Referenced) => {
                    warn!("Keeping uncommitted chunk {}: referenced by another job", chunk);
                    self.catalog.put_chunk(record).await;
                }
                _ => {
                    if let Err(cleanup) = self.chunks.delete_chunk(&location).await {
                        warn!("Failed to remove uncommitted chunk {}: {}", chunk, cleanup);
                    }
                }
            }
            return Err(e);
        }

        self.catalog.put_chunk(record).await;
        Ok((chunk, refs))
    }

    fn rollback(&self, store: StoreId, refs: &[SignatureRef]) {
        if refs.is_empty() {
            return;
        }
        if let Err(e) = self.dedup.release_references(store, refs) {
            warn!("Failed to roll back {} references: {}", refs.len(), e);
        }
    }

    /// Job submitter callback: the job finished successfully.
    ///
    /// `signatures_written` carries references made outside
    /// [`write_chunk`](Self::write_chunk); they are committed here.
    #[instrument(skip(self, chunk_ids, signatures_written))]
    pub async fn on_job_completed(
        &self,
        job: JobId,
        chunk_ids: &[ChunkId],
        signatures_written: &[SignatureRef],
    ) -> StorageResult<JobRecord> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;
        let mut record = self.catalog.job(job).await?;
        if record.status.is_finished() {
            self.release_job_lock(job);
            return Err(StorageError::InvalidState(format!("job {} is not running", job)));
        }

        if !signatures_written.is_empty() {
            self.dedup
                .commit_references(record.store, signatures_written)?;
            record.references.extend_from_slice(signatures_written);
        }
        for chunk in chunk_ids {
            if !record.written_chunks.contains(chunk) {
                record.written_chunks.push(*chunk);
            }
        }

        record.status = JobStatus::Completed;
        record.completed_at = Some(Utc::now());
        if record.level.is_full() {
            self.catalog
                .set_next_backup_full(record.subclient, false)
                .await;
        }
        self.catalog.put_job(record.clone()).await;
        self.release_job_lock(job);
        info!(
            "Job {} completed: {} chunks, {} references",
            job,
            record.written_chunks.len(),
            record.references.len()
        );
        Ok(record)
    }

    /// Job submitter callback: the job failed or was killed. Everything
    /// it wrote or referenced is staged for pruning.
    #[instrument(skip(self))]
    pub async fn on_job_failed(&self, job: JobId, status: JobStatus) -> StorageResult<usize> {
        if !matches!(status, JobStatus::Failed | JobStatus::Killed) {
            return Err(StorageError::InvalidState(format!(
                "{:?} is not a failure status",
                status
            )));
        }
        {
            let lock = self.job_lock(job);
            let _guard = lock.lock().await;
            let mut record = self.catalog.job(job).await?;
            if record.status.is_finished() {
                self.release_job_lock(job);
                return Err(StorageError::InvalidState(format!("job {} is not running", job)));
            }
            record.status = status;
            record.completed_at = Some(Utc::now());
            self.catalog.put_job(record).await;
            self.release_job_lock(job);
        }
        warn!("Job {} ended {:?}", job, status);
        self.retention.delete_job(job).await
    }

    /// Job submitter callback: the job was deleted
    pub async fn on_job_deleted(&self, job: JobId) -> StorageResult<usize> {
        self.retention.delete_job(job).await
    }

    /// Read a chunk's segments for a restore, holding a read lease
    pub async fn restore_chunk(&self, chunk: ChunkId) -> StorageResult<Vec<Bytes>> {
        let record = self
            .catalog
            .chunk(chunk)
            .await
            .ok_or(StorageError::ChunkNotFound(chunk))?;
        let _lease = self
            .leases
            .acquire_read(chunk)
            .ok_or(StorageError::ChunkBusy(chunk))?;
        let data = self.chunks.read_chunk(&ChunkLocation::from(&record)).await?;
        let container = ChunkContainer::from_bytes(&data)?;
        Ok(container
            .into_segments()
            .into_iter()
            .map(|segment| segment.data)
            .collect())
    }

    // ---- metadata queries ----

    pub fn get_zero_ref_count(&self, store: StoreId, substore: SubstoreId) -> StorageResult<u64> {
        self.dedup.zero_ref_count(store, substore)
    }

    /// `MMDeletedAF` rows for a store
    pub async fn get_deletion_pending_count(&self, store: StoreId) -> StorageResult<usize> {
        self.dedup.store_info(store)?;
        Ok(self.catalog.pending_count(store).await)
    }

    pub async fn deletion_pending(&self, store: StoreId) -> StorageResult<Vec<DeletionPendingEntry>> {
        self.dedup.store_info(store)?;
        Ok(self.catalog.pending(store).await)
    }

    pub async fn get_chunk_verification_status(&self, job: JobId) -> StorageResult<ArchCheckStatus> {
        self.catalog.job(job).await?;
        Ok(self.catalog.job_verification(job).await)
    }

    /// Whether the chunk is cataloged and its container is on disk
    pub async fn is_chunk_present(&self, chunk: ChunkId) -> StorageResult<bool> {
        match self.catalog.chunk(chunk).await {
            Some(record) => self.chunks.chunk_exists(&ChunkLocation::from(&record)).await,
            None => Ok(false),
        }
    }

    pub async fn job(&self, job: JobId) -> StorageResult<JobRecord> {
        self.catalog.job(job).await
    }

    pub async fn next_backup_full(&self, subclient: SubclientId) -> bool {
        self.catalog.next_backup_full(subclient).await
    }

    /// Drop ledger entries, optionally narrowed to a store and a DV2 job
    pub async fn bad_chunks(
        &self,
        store: Option<StoreId>,
        verification_job: Option<VerificationJobId>,
    ) -> Vec<ChunkDropEntry> {
        self.catalog
            .drops(store)
            .await
            .into_iter()
            .filter(|d| verification_job.map_or(true, |v| d.verification_job == v))
            .collect()
    }

    pub async fn chunks_for_job(&self, job: JobId) -> StorageResult<Vec<ChunkPath>> {
        let record = self.catalog.job(job).await?;
        let mut paths = Vec::new();
        for chunk in record.chunks() {
            let Some(chunk) = self.catalog.chunk(chunk).await else {
                continue;
            };
            paths.push(ChunkPath {
                chunk: chunk.id,
                volume: chunk.volume,
                mount_path: chunk.mount_path,
                path: self
                    .mount_paths
                    .root(chunk.mount_path)?
                    .join(chunk.relative_dir()),
            });
        }
        Ok(paths)
    }

    pub async fn verification_job(&self, id: VerificationJobId) -> StorageResult<VerificationJob> {
        self.catalog.verification_job(id).await
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.catalog.alerts().await
    }

    pub async fn prune_events(&self, store: StoreId) -> Vec<PruneEvent> {
        self.catalog.prune_events(store).await
    }

    pub async fn pruning_phase_reached(&self, store: StoreId, phase: PrunePhase) -> bool {
        self.catalog.pruning_phase_reached(store, phase).await
    }

    pub fn primary_record_count(&self, store: StoreId) -> StorageResult<u64> {
        self.dedup.primary_record_count(store)
    }

    pub fn secondary_record_count(&self, store: StoreId) -> StorageResult<u64> {
        self.dedup.secondary_record_count(store)
    }

    pub fn stores(&self) -> Vec<StoreId> {
        self.dedup.stores()
    }

    pub async fn store_status(&self, store: StoreId) -> StorageResult<StoreStatus> {
        let info = self.dedup.store_info(store)?;
        let mut substores = Vec::with_capacity(info.substores.len());
        for id in &info.substores {
            substores.push(SubstoreSummary {
                id: *id,
                status: self.dedup.substore_status(store, *id)?.code(),
                zero_refs: self.dedup.zero_ref_count(store, *id)?,
                awaiting_sweep: self.dedup.marked_count(store, *id)?,
            });
        }

        let used: BTreeSet<MountPathId> = self
            .catalog
            .chunks(store)
            .await
            .iter()
            .map(|c| c.mount_path)
            .collect();
        let mut mount_paths = Vec::with_capacity(used.len());
        for path in self.mount_paths.list() {
            if !used.contains(&path.id) {
                continue;
            }
            let mut usage = MountPathUsage {
                id: path.id,
                online: path.online,
                chunk_folders: 0,
                bytes: 0,
            };
            if path.online {
                match self.chunks.stats(path.id).await {
                    Ok(stats) => {
                        usage.chunk_folders = stats.chunk_count;
                        usage.bytes = stats.chunk_bytes;
                    }
                    Err(e) => warn!("Failed to scan mount path {}: {}", path.id, e),
                }
            }
            mount_paths.push(usage);
        }

        Ok(StoreStatus {
            mount_paths,
            substores,
            pending_entries: self.catalog.pending_count(store).await,
            primary_records: self.dedup.primary_record_count(store)?,
            secondary_records: self.dedup.secondary_record_count(store)?,
            bad_chunks: self.catalog.drops(Some(store)).await.len(),
            info,
        })
    }

    // ---- runs ----

    /// Mark, sweep and physically prune a store as one task
    pub async fn run_pruning(
        &self,
        store: StoreId,
        options: &PruneOptions,
    ) -> StorageResult<PruneCycleResult> {
        let _guard = self.prune_lock.lock().await;
        let (upid, cancel) = self.tasks.create(WorkerType::Prune, Some(store)).await;
        let result = self.pruner.run_cycle(store, options, &cancel).await;
        if let Ok(cycle) = &result {
            self.metrics.record_logical(store, &cycle.logical);
            self.metrics.record_physical(store, &cycle.physical);
        }
        self.close_task(&upid, &result, |cycle| {
            (
                format!(
                    "released {} refs, confirmed {} zero-ref, deleted {} chunks, {} blocked",
                    cycle.logical.references_released,
                    cycle.logical.signatures_confirmed,
                    cycle.physical.chunks_deleted,
                    cycle.logical.entries_blocked + cycle.physical.blocked_offline
                ),
                cycle.logical.errors.len() + cycle.physical.errors.len(),
            )
        })
        .await;
        self.refresh_gauges(store).await;
        result
    }

    /// Mark and sweep only
    pub async fn run_logical_pruning(&self, store: StoreId) -> StorageResult<LogicalPruneResult> {
        let _guard = self.prune_lock.lock().await;
        let (upid, cancel) = self.tasks.create(WorkerType::Prune, Some(store)).await;
        let result = self.pruner.run_logical(store, &cancel).await;
        if let Ok(logical) = &result {
            self.metrics.record_logical(store, logical);
        }
        self.close_task(&upid, &result, |r| {
            (
                format!(
                    "mark and sweep: released {} refs, confirmed {} zero-ref",
                    r.references_released, r.signatures_confirmed
                ),
                r.errors.len(),
            )
        })
        .await;
        self.refresh_gauges(store).await;
        result
    }

    /// Physical pruning only
    pub async fn run_physical_pruning(
        &self,
        store: StoreId,
        options: &PruneOptions,
    ) -> StorageResult<PhysicalPruneResult> {
        let _guard = self.prune_lock.lock().await;
        let (upid, cancel) = self.tasks.create(WorkerType::Prune, Some(store)).await;
        let result = self.pruner.run_physical(store, options, &cancel).await;
        if let Ok(physical) = &result {
            self.metrics.record_physical(store, physical);
        }
        self.close_task(&upid, &result, |r| {
            (
                format!(
                    "physical: deleted {} chunks, freed {} bytes",
                    r.chunks_deleted, r.bytes_freed
                ),
                r.errors.len(),
            )
        })
        .await;
        self.refresh_gauges(store).await;
        result
    }

    pub async fn retry_failed_deletes(&self, store: StoreId) -> StorageResult<usize> {
        let _guard = self.prune_lock.lock().await;
        self.pruner.retry_failed_deletes(store).await
    }

    /// Run a DV2 job as a task
    pub async fn run_verification(
        &self,
        store: StoreId,
        scope: VerifyScope,
        depth: VerifyDepth,
    ) -> StorageResult<VerificationJob> {
        let (upid, cancel) = self.tasks.create(WorkerType::Verify, Some(store)).await;
        let result = self.verifier.verify(store, scope, depth, &cancel).await;
        if let Ok(job) = &result {
            self.metrics.record_verification(job);
        }
        self.close_task(&upid, &result, |job| {
            (
                format!(
                    "verification job {} {}: {} good, {} bad",
                    job.id,
                    job.state.as_str(),
                    job.chunks_good,
                    job.chunks_bad
                ),
                job.chunks_bad as usize,
            )
        })
        .await;
        result
    }

    pub async fn run_data_aging(&self, now: DateTime<Utc>) -> StorageResult<AgingResult> {
        let (upid, _cancel) = self.tasks.create(WorkerType::DataAging, None).await;
        let result = self.retention.run_data_aging(now).await;
        self.close_task(&upid, &result, |r| {
            (
                format!("aged {} jobs, staged {} entries", r.jobs_aged, r.entries_staged),
                r.errors.len(),
            )
        })
        .await;
        result
    }

    pub async fn abort_task(&self, upid: &str) -> bool {
        self.tasks.abort(upid).await
    }

    pub async fn list_tasks(&self, running: Option<bool>) -> Vec<TaskSnapshot> {
        self.tasks.list(running, None).await
    }

    async fn close_task<T>(
        &self,
        upid: &str,
        result: &StorageResult<T>,
        summary: impl FnOnce(&T) -> (String, usize),
    ) {
        match result {
            Ok(value) => {
                let (line, warnings) = summary(value);
                self.tasks.log(upid, &line).await;
                let exit = if warnings == 0 {
                    "OK".to_string()
                } else {
                    format!("WARNINGS: {}", warnings)
                };
                self.tasks.finish(upid, &exit).await;
            }
            Err(e) => {
                self.tasks.log(upid, &format!("error: {}", e)).await;
                self.tasks.finish(upid, &format!("ERROR: {}", e)).await;
            }
        }
    }

    async fn refresh_gauges(&self, store: StoreId) {
        if let Ok(zero_refs) = self.dedup.store_zero_ref_count(store) {
            let pending = self.catalog.pending_count(store).await;
            self.metrics.update_store_gauges(store, pending, zero_refs);
        }
    }

    // ---- persistence ----

    /// Write state and task history if a data directory is configured
    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence
            .save_state(StateData {
                version: 0,
                catalog: self.catalog.snapshot().await,
                dedup: self.dedup.snapshot(),
                mount_paths: self.mount_paths.snapshot(),
            })
            .await?;
        persistence.save_tasks(&self.tasks.snapshot().await).await?;
        debug!("Saved engine state");
        Ok(())
    }
}
