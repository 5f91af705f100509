//! Shared fixture for engine tests

use bytes::Bytes;
use chrono::Utc;
use sidb_core::{
    BackupLevel, ChunkContainer, ChunkRecord, Config, JobId, JobRecord, JobStatus,
    MountPathId, Segment, SignatureRef, StoreId, SubclientId, SubstoreId, VolumeId,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;

use crate::backend::{ChunkLocation, ChunkWriter};
use crate::catalog::{MemoryCatalog, MetadataStore};
use crate::dedup::DedupStore;
use crate::leases::ChunkLeases;
use crate::local::LocalChunkStore;
use crate::mountpath::MountPathAvailability;
use crate::prune::PruningEngine;
use crate::retention::RetentionEngine;
use crate::verify::VerificationEngine;

pub struct Fixture {
    pub dir: TempDir,
    pub catalog: Arc<MemoryCatalog>,
    pub dedup: Arc<DedupStore>,
    pub mount_paths: Arc<MountPathAvailability>,
    pub chunks: Arc<LocalChunkStore>,
    pub leases: ChunkLeases,
    pub config: Arc<RwLock<Config>>,
    pub store: StoreId,
    pub substore: SubstoreId,
    pub mount_path: MountPathId,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mount_paths = Arc::new(MountPathAvailability::new());
        let mount_path = mount_paths.add("M1", dir.path());
        let dedup = Arc::new(DedupStore::new());
        let store = dedup.create_store("S");
        let substore = dedup.add_partition(store, "/ddb/p1", "ma1", false).unwrap();
        Self {
            dir,
            catalog: Arc::new(MemoryCatalog::new()),
            dedup,
            chunks: Arc::new(LocalChunkStore::new(mount_paths.clone())),
            mount_paths,
            leases: ChunkLeases::new(),
            config: Arc::new(RwLock::new(Config::default().with_delete_backoff_ms(1))),
            store,
            substore,
            mount_path,
        }
    }

    pub fn retention(&self) -> RetentionEngine {
        RetentionEngine::new(self.catalog.clone(), self.dedup.clone(), self.config.clone())
    }

    pub fn pruner(&self) -> PruningEngine {
        PruningEngine::new(
            self.catalog.clone(),
            self.dedup.clone(),
            self.chunks.clone(),
            self.mount_paths.clone(),
            self.leases.clone(),
            self.config.clone(),
        )
    }

    pub fn verifier(&self) -> VerificationEngine {
        VerificationEngine::new(
            self.catalog.clone(),
            self.dedup.clone(),
            self.chunks.clone(),
            self.leases.clone(),
            self.config.clone(),
        )
    }

    /// Completed job that wrote one chunk holding `payloads`
    pub async fn backup(&self, job: u64, payloads: &[&str]) -> (JobId, ChunkRecord) {
        let job_id = JobId(job);
        let chunk_id = self.catalog.allocate_chunk_id().await;
        let segments: Vec<Segment> = payloads
            .iter()
            .map(|p| Segment::new(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        let container = ChunkContainer::new(segments, false);
        let location = ChunkLocation::new(self.mount_path, VolumeId(1), chunk_id);
        let size = self
            .chunks
            .write_chunk(&location, Bytes::from(container.to_bytes().unwrap()))
            .await
            .unwrap();

        let refs: Vec<SignatureRef> = container
            .signatures()
            .into_iter()
            .map(|signature| SignatureRef {
                substore: self.substore,
                signature,
                chunk: chunk_id,
            })
            .collect();
        self.dedup.commit_references(self.store, &refs).unwrap();

        let chunk = ChunkRecord {
            id: chunk_id,
            volume: VolumeId(1),
            mount_path: self.mount_path,
            store: self.store,
            substore: self.substore,
            signatures: container.signatures(),
            size,
            written_by: job_id,
            created_at: Utc::now(),
            last_verified: None,
        };
        self.catalog.put_chunk(chunk.clone()).await;

        let mut record = JobRecord::new(
            job_id,
            SubclientId(1),
            self.store,
            BackupLevel::Full,
            BackupLevel::Full,
        );
        record.status = JobStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.written_chunks = vec![chunk_id];
        record.references = refs;
        self.catalog.put_job(record).await;
        (job_id, chunk)
    }

    /// Completed incremental that deduplicated fully into `chunk`
    pub async fn dedup_backup(&self, job: u64, chunk: &ChunkRecord) -> JobId {
        let job_id = JobId(job);
        let mut refs = Vec::new();
        for signature in &chunk.signatures {
            self.dedup
                .increment_reference(self.store, self.substore, signature)
                .unwrap();
            refs.push(SignatureRef {
                substore: self.substore,
                signature: *signature,
                chunk: chunk.id,
            });
        }
        let mut record = JobRecord::new(
            job_id,
            SubclientId(1),
            self.store,
            BackupLevel::Incremental,
            BackupLevel::Incremental,
        );
        record.status = JobStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.references = refs;
        self.catalog.put_job(record).await;
        job_id
    }

    pub fn chunk_dir(&self, chunk: &ChunkRecord) -> std::path::PathBuf {
        self.dir.path().join(chunk.relative_dir())
    }

    pub async fn pending(&self) -> usize {
        self.catalog.pending_count(self.store).await
    }

    pub fn zero_refs(&self) -> u64 {
        self.dedup.zero_ref_count(self.store, self.substore).unwrap()
    }
}

