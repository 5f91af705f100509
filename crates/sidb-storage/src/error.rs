//! Storage error types

use sidb_core::{ChunkId, JobId, MountPathId, StoreId, SubstoreId, VerificationJobId};
use thiserror::Error;

/// Storage error type
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Store not found: {0}")]
    StoreNotFound(StoreId),

    #[error("Substore not found: {store}/{substore}")]
    SubstoreNotFound { store: StoreId, substore: SubstoreId },

    #[error("Substore {store}/{substore} is offline")]
    SubstoreOffline { store: StoreId, substore: SubstoreId },

    #[error("Store {0} is sealed")]
    StoreSealed(StoreId),

    #[error("Partition path already in use by store {store}: {path}")]
    PartitionPathInUse { store: StoreId, path: String },

    #[error("Mount path not found: {0}")]
    MountPathNotFound(MountPathId),

    #[error("Mount path {0} is offline")]
    MountPathOffline(MountPathId),

    #[error("Mount path {0} is read-only")]
    MountPathReadOnly(MountPathId),

    #[error("Chunk {0} is in use")]
    ChunkBusy(ChunkId),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Verification job not found: {0}")]
    VerificationJobNotFound(VerificationJobId),

    #[error("Signature {signature} is not indexed in store {store}")]
    SignatureNotIndexed { store: StoreId, signature: String },

    #[error("Failed to delete chunk {chunk} after {attempts} attempts: {reason}")]
    PhysicalDelete {
        chunk: ChunkId,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] sidb_core::Error),
}

impl StorageError {
    /// Errors that defer work to the next cycle instead of failing it
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::MountPathOffline(_)
                | StorageError::ChunkBusy(_)
                | StorageError::SubstoreOffline { .. }
        )
    }
}

/// Result type alias
pub type StorageResult<T> = Result<T, StorageError>;
