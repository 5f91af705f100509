//! Chunk in-use tracking
//!
//! Restores and verification hold a read lease while they open a chunk.
//! Physical pruning takes a delete lease, which is refused while any reader
//! is active and blocks new readers until the delete finishes.

use dashmap::DashMap;
use sidb_core::ChunkId;
use std::sync::Arc;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Default)]
struct LeaseState {
    readers: usize,
    deleting: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkLeases {
    states: Arc<DashMap<ChunkId, LeaseState>>,
}

impl ChunkLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if the chunk is being deleted
    pub fn acquire_read(&self, chunk: ChunkId) -> Option<ReadLease> {
        let mut state = self.states.entry(chunk).or_default();
        if state.deleting {
            return None;
        }
        state.readers += 1;
        Some(ReadLease {
            states: self.states.clone(),
            chunk,
        })
    }

    pub fn begin_delete(&self, chunk: ChunkId) -> StorageResult<DeleteLease> {
        let mut state = self.states.entry(chunk).or_default();
        if state.readers > 0 || state.deleting {
            return Err(StorageError::ChunkBusy(chunk));
        }
        state.deleting = true;
        Ok(DeleteLease {
            states: self.states.clone(),
            chunk,
        })
    }

    pub fn readers(&self, chunk: ChunkId) -> usize {
        self.states.get(&chunk).map(|s| s.readers).unwrap_or(0)
    }

    pub fn is_busy(&self, chunk: ChunkId) -> bool {
        self.states
            .get(&chunk)
            .map(|s| s.readers > 0 || s.deleting)
            .unwrap_or(false)
    }
}

/// Held by a reader; released on drop
#[derive(Debug)]
pub struct ReadLease {
    states: Arc<DashMap<ChunkId, LeaseState>>,
    chunk: ChunkId,
}

impl ReadLease {
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if let Some(mut state) = self.states.get_mut(&self.chunk) {
            state.readers = state.readers.saturating_sub(1);
        }
        self.states
            .remove_if(&self.chunk, |_, s| s.readers == 0 && !s.deleting);
    }
}

/// Held by physical pruning while a chunk folder is removed
#[derive(Debug)]
pub struct DeleteLease {
    states: Arc<DashMap<ChunkId, LeaseState>>,
    chunk: ChunkId,
}

impl Drop for DeleteLease {
    fn drop(&mut self) {
        self.states.remove(&self.chunk);
    }
}
