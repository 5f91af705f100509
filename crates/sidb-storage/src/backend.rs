//! Chunk store trait definitions
//!
//! These traits define the interface for pluggable chunk storage under
//! disk library mount paths.

use async_trait::async_trait;
use bytes::Bytes;
use sidb_core::{model::chunk_relative_dir, ChunkId, ChunkRecord, MountPathId, VolumeId};
use std::path::PathBuf;

use crate::error::StorageResult;

/// Where a chunk lives physically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkLocation {
    pub mount_path: MountPathId,
    pub volume: VolumeId,
    pub chunk: ChunkId,
}

impl ChunkLocation {
    pub fn new(mount_path: MountPathId, volume: VolumeId, chunk: ChunkId) -> Self {
        Self {
            mount_path,
            volume,
            chunk,
        }
    }

    /// `CV_MAGNETIC/V_<volume>/CHUNK_<id>` relative to the mount path root
    pub fn relative_dir(&self) -> PathBuf {
        chunk_relative_dir(self.volume, self.chunk)
    }
}

impl From<&ChunkRecord> for ChunkLocation {
    fn from(record: &ChunkRecord) -> Self {
        Self::new(record.mount_path, record.volume, record.id)
    }
}

/// Read access to chunk folders
#[async_trait]
pub trait ChunkReader: Send + Sync {
    /// Check if the chunk's container file exists
    async fn chunk_exists(&self, location: &ChunkLocation) -> StorageResult<bool>;

    /// Read the raw container bytes
    async fn read_chunk(&self, location: &ChunkLocation) -> StorageResult<Bytes>;

    /// Size of the container file in bytes
    async fn chunk_size(&self, location: &ChunkLocation) -> StorageResult<u64>;

    /// List chunk folders present on a mount path
    async fn list_chunks(&self, mount_path: MountPathId) -> StorageResult<Vec<ChunkLocation>>;
}

/// Write access to chunk folders
#[async_trait]
pub trait ChunkWriter: ChunkReader {
    /// Write a new chunk container, returning bytes written
    async fn write_chunk(&self, location: &ChunkLocation, data: Bytes) -> StorageResult<u64>;

    /// Delete a chunk's folder. A missing folder is an error.
    async fn delete_chunk(&self, location: &ChunkLocation) -> StorageResult<()>;
}

/// Full chunk store trait
#[async_trait]
pub trait ChunkStore: ChunkWriter {
    /// Get backend name/type
    fn name(&self) -> &str;

    /// Get statistics for one mount path
    async fn stats(&self, mount_path: MountPathId) -> StorageResult<BackendStats>;
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Chunk folders on the mount path
    pub chunk_count: u64,
    /// Bytes used by chunk containers
    pub chunk_bytes: u64,
}
