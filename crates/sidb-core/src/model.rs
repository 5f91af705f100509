//! Catalog records
//!
//! Typed versions of the rows the media management database keeps for
//! jobs, chunks, pending deletions and verification results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::ids::{ChunkId, JobId, MountPathId, StoreId, SubclientId, SubstoreId, VerificationJobId, VolumeId};
use crate::signature::Signature;

/// Top-level folder of a disk library mount path
pub const MAGNETIC_DIR: &str = "CV_MAGNETIC";

/// Relative folder of a chunk under its mount path:
/// `CV_MAGNETIC/V_<volume>/CHUNK_<id>`
pub fn chunk_relative_dir(volume: VolumeId, chunk: ChunkId) -> PathBuf {
    PathBuf::from(MAGNETIC_DIR)
        .join(format!("V_{}", volume))
        .join(format!("CHUNK_{}", chunk))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupLevel {
    Full,
    Incremental,
    Differential,
    SyntheticFull,
}

impl BackupLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupLevel::Full => "Full",
            BackupLevel::Incremental => "Incremental",
            BackupLevel::Differential => "Differential",
            BackupLevel::SyntheticFull => "Synthetic Full",
        }
    }

    /// Whether this level starts a new retention cycle
    pub fn is_full(&self) -> bool {
        matches!(self, BackupLevel::Full | BackupLevel::SyntheticFull)
    }
}

impl fmt::Display for BackupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Verification status of a backup job (`archCheckStatus`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchCheckStatus {
    NotVerified,
    Good,
    Bad,
}

impl ArchCheckStatus {
    pub fn code(&self) -> i32 {
        match self {
            ArchCheckStatus::NotVerified => 0,
            ArchCheckStatus::Good => 5,
            ArchCheckStatus::Bad => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ArchCheckStatus::NotVerified),
            5 => Some(ArchCheckStatus::Good),
            6 => Some(ArchCheckStatus::Bad),
            _ => None,
        }
    }
}

/// One committed reference increment made by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureRef {
    pub substore: SubstoreId,
    pub signature: Signature,
    /// Chunk the signature's data lives in
    pub chunk: ChunkId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub subclient: SubclientId,
    pub store: StoreId,
    pub level: BackupLevel,
    /// Level the submitter asked for before promotion
    pub requested_level: BackupLevel,
    pub status: JobStatus,
    /// Chunks this job wrote
    pub written_chunks: Vec<ChunkId>,
    /// Reference increments committed on completion
    pub references: Vec<SignatureRef>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        subclient: SubclientId,
        store: StoreId,
        requested_level: BackupLevel,
        level: BackupLevel,
    ) -> Self {
        Self {
            id,
            subclient,
            store,
            level,
            requested_level,
            status: JobStatus::Running,
            written_chunks: Vec::new(),
            references: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn was_promoted(&self) -> bool {
        self.level != self.requested_level
    }

    /// Every chunk the job depends on: written or deduplicated into
    pub fn chunks(&self) -> BTreeSet<ChunkId> {
        let mut chunks: BTreeSet<ChunkId> = self.written_chunks.iter().copied().collect();
        chunks.extend(self.references.iter().map(|r| r.chunk));
        chunks
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub volume: VolumeId,
    pub mount_path: MountPathId,
    pub store: StoreId,
    /// Substore owning the chunk's first signature
    pub substore: SubstoreId,
    pub signatures: Vec<Signature>,
    pub size: u64,
    pub written_by: JobId,
    pub created_at: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl ChunkRecord {
    pub fn relative_dir(&self) -> PathBuf {
        chunk_relative_dir(self.volume, self.id)
    }
}

/// Lifecycle of a deletion-pending entry.
///
/// `Active` chunks have no entry; a physically pruned chunk's entry is
/// removed and the prune is recorded as a phase 3 event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    LogicalPruneStaged,
    MarkAndSweepPending,
    ZeroRef,
    BlockedOffline,
    DeleteFailed,
}

/// `MMDeletedAF` row: a (job, chunk) pair waiting for pruning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionPendingEntry {
    pub store: StoreId,
    pub substore: SubstoreId,
    pub chunk: ChunkId,
    pub job: JobId,
    pub status: PendingStatus,
    /// References this entry releases during the mark phase
    pub references: Vec<SignatureRef>,
    /// Set once the references were released
    pub logical_done: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeletionPendingEntry {
    pub fn new(
        store: StoreId,
        substore: SubstoreId,
        chunk: ChunkId,
        job: JobId,
        references: Vec<SignatureRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            store,
            substore,
            chunk,
            job,
            status: PendingStatus::LogicalPruneStaged,
            references,
            logical_done: false,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> (JobId, ChunkId) {
        (self.job, self.chunk)
    }

    pub fn set_status(&mut self, status: PendingStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// `archChunkDDBDrop` row: a chunk a verification job found bad
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDropEntry {
    pub store: StoreId,
    pub verification_job: VerificationJobId,
    pub chunk: ChunkId,
    pub reason: String,
    pub dropped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrunePhase {
    /// References of an entry were released
    ReferencesReleased,
    /// Every entry of a job was resolved
    JobPruned,
    /// Chunk was finalized and its folder deleted
    ChunkFinalized,
}

impl PrunePhase {
    pub fn number(&self) -> u8 {
        match self {
            PrunePhase::ReferencesReleased => 1,
            PrunePhase::JobPruned => 2,
            PrunePhase::ChunkFinalized => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneEvent {
    pub store: StoreId,
    pub phase: PrunePhase,
    pub job: Option<JobId>,
    pub chunk: Option<ChunkId>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    PhysicalDeleteFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub store: StoreId,
    pub chunk: ChunkId,
    pub kind: AlertKind,
    pub message: String,
    pub attempts: u32,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyScope {
    /// Every chunk in the store
    Full,
    /// Only chunks not verified before
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyDepth {
    /// Metadata and, optionally, file existence
    Quick,
    /// Read and checksum every chunk
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    Scheduled,
    Running,
    Completed,
    CompletedWithErrors,
    Killed,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Scheduled => "Scheduled",
            VerificationState::Running => "Running",
            VerificationState::Completed => "Completed",
            VerificationState::CompletedWithErrors => "Completed w/ one or more errors",
            VerificationState::Killed => "Killed",
        }
    }
}

/// A DV2 run and its counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationJob {
    pub id: VerificationJobId,
    pub store: StoreId,
    pub scope: VerifyScope,
    pub depth: VerifyDepth,
    pub state: VerificationState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub chunks_examined: u64,
    pub chunks_good: u64,
    pub chunks_bad: u64,
    pub chunks_skipped: u64,
    pub chunks_repaired: u64,
}

impl VerificationJob {
    pub fn new(id: VerificationJobId, store: StoreId, scope: VerifyScope, depth: VerifyDepth) -> Self {
        Self {
            id,
            store,
            scope,
            depth,
            state: VerificationState::Scheduled,
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            chunks_examined: 0,
            chunks_good: 0,
            chunks_bad: 0,
            chunks_skipped: 0,
            chunks_repaired: 0,
        }
    }
}
