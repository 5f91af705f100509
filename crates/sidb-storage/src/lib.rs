//! Storage engines for the deduplication store
//!
//! This crate provides the chunk store on disk library mount paths, the
//! signature index, and the retention, pruning and verification engines
//! that drive a store's data lifecycle.

pub mod backend;
pub mod catalog;
pub mod dedup;
pub mod error;
pub mod leases;
pub mod local;
pub mod mountpath;
pub mod prune;
pub mod retention;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use backend::{BackendStats, ChunkLocation, ChunkReader, ChunkStore, ChunkWriter};
pub use catalog::{CatalogTables, MemoryCatalog, MetadataStore};
pub use dedup::{
    DedupSnapshot, DedupStore, Reclaimability, SignatureEntry, SignatureState, StoreInfo,
    SubstoreStatus,
};
pub use error::{StorageError, StorageResult};
pub use leases::{ChunkLeases, DeleteLease, ReadLease};
pub use local::LocalChunkStore;
pub use mountpath::{AccessType, MountPath, MountPathAvailability};
pub use prune::{
    LogicalPruneResult, PhysicalPruneResult, PruneCycleResult, PruneOptions, PruningEngine,
};
pub use retention::{AgingResult, RetentionEngine};
pub use verify::VerificationEngine;
