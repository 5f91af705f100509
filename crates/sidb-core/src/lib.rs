//! Deduplication store core data structures
//!
//! This crate holds the types shared by the storage engines and the engine
//! host: typed identifiers, content signatures, the chunk container format,
//! catalog records and the runtime configuration.

pub mod cancel;
pub mod config;
pub mod container;
pub mod error;
pub mod ids;
pub mod model;
pub mod signature;

pub use cancel::CancelFlag;
pub use config::{Config, RetentionRule, StoreSettings};
pub use container::{ChunkContainer, ContainerType, Segment, CONTAINER_FILE_NAME};
pub use error::{Error, Result};
pub use ids::{
    ChunkId, JobId, MountPathId, StoreId, SubclientId, SubstoreId, VerificationJobId, VolumeId,
};
pub use model::{
    Alert, AlertKind, ArchCheckStatus, BackupLevel, ChunkDropEntry, ChunkRecord,
    DeletionPendingEntry, JobRecord, JobStatus, PendingStatus, PruneEvent, PrunePhase,
    SignatureRef, VerificationJob, VerificationState, VerifyDepth, VerifyScope,
};
pub use signature::Signature;
