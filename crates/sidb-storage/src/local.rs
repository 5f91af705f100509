//! Local filesystem chunk store
//!
//! Chunks live under their mount path root:
//! - <root>/CV_MAGNETIC/V_<volume>/CHUNK_<id>/SFILE_CONTAINER_001

use async_trait::async_trait;
use bytes::Bytes;
use sidb_core::{ChunkId, MountPathId, VolumeId, CONTAINER_FILE_NAME};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::backend::{BackendStats, ChunkLocation, ChunkReader, ChunkStore, ChunkWriter};
use crate::error::{StorageError, StorageResult};
use crate::mountpath::MountPathAvailability;

/// Local filesystem chunk store
pub struct LocalChunkStore {
    mount_paths: Arc<MountPathAvailability>,
}

impl LocalChunkStore {
    pub fn new(mount_paths: Arc<MountPathAvailability>) -> Self {
        Self { mount_paths }
    }

    fn chunk_dir(&self, location: &ChunkLocation) -> StorageResult<PathBuf> {
        let root = self.mount_paths.root(location.mount_path)?;
        Ok(root.join(location.relative_dir()))
    }

    fn container_path(&self, location: &ChunkLocation) -> StorageResult<PathBuf> {
        Ok(self.chunk_dir(location)?.join(CONTAINER_FILE_NAME))
    }
}

fn parse_prefixed(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[async_trait]
impl ChunkReader for LocalChunkStore {
    #[instrument(skip(self), fields(chunk = %location.chunk))]
    async fn chunk_exists(&self, location: &ChunkLocation) -> StorageResult<bool> {
        let path = self.container_path(location)?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(chunk = %location.chunk))]
    async fn read_chunk(&self, location: &ChunkLocation) -> StorageResult<Bytes> {
        let path = self.container_path(location)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ChunkNotFound(location.chunk))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn chunk_size(&self, location: &ChunkLocation) -> StorageResult<u64> {
        let path = self.container_path(location)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ChunkNotFound(location.chunk))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list_chunks(&self, mount_path: MountPathId) -> StorageResult<Vec<ChunkLocation>> {
        let magnetic = self
            .mount_paths
            .root(mount_path)?
            .join(sidb_core::model::MAGNETIC_DIR);
        let mut chunks = Vec::new();

        if !fs::try_exists(&magnetic).await? {
            return Ok(chunks);
        }

        let mut volumes = fs::read_dir(&magnetic).await?;
        while let Some(volume_entry) = volumes.next_entry().await? {
            if !volume_entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(volume) = volume_entry
                .file_name()
                .to_str()
                .and_then(|n| parse_prefixed(n, "V_"))
            else {
                continue;
            };

            let mut chunk_dirs = fs::read_dir(volume_entry.path()).await?;
            while let Some(chunk_entry) = chunk_dirs.next_entry().await? {
                if let Some(chunk) = chunk_entry
                    .file_name()
                    .to_str()
                    .and_then(|n| parse_prefixed(n, "CHUNK_"))
                {
                    chunks.push(ChunkLocation::new(
                        mount_path,
                        VolumeId(volume),
                        ChunkId(chunk),
                    ));
                }
            }
        }

        Ok(chunks)
    }
}

#[async_trait]
impl ChunkWriter for LocalChunkStore {
    #[instrument(skip(self, data), fields(chunk = %location.chunk, size = data.len()))]
    async fn write_chunk(&self, location: &ChunkLocation, data: Bytes) -> StorageResult<u64> {
        let dir = self.chunk_dir(location)?;
        fs::create_dir_all(&dir).await?;

        // Write atomically using temp file + rename
        let path = dir.join(CONTAINER_FILE_NAME);
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        debug!("Wrote chunk container {:?}", path);

        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(chunk = %location.chunk))]
    async fn delete_chunk(&self, location: &ChunkLocation) -> StorageResult<()> {
        let dir = self.chunk_dir(location)?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ChunkNotFound(location.chunk))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn stats(&self, mount_path: MountPathId) -> StorageResult<BackendStats> {
        let mut stats = BackendStats::default();

        for location in self.list_chunks(mount_path).await? {
            stats.chunk_count += 1;
            if let Ok(size) = self.chunk_size(&location).await {
                stats.chunk_bytes += size;
            }
        }

        Ok(stats)
    }
}
