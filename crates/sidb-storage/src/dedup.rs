//! Deduplication store (SIDB)
//!
//! Maps content signatures to the chunk holding them and keeps a reference
//! count per signature. A store is split into substores; each substore is
//! locked independently, so increments and decrements of the same
//! signature are serialized while other partitions proceed in parallel.
//!
//! A signature whose count drops to zero is first `Marked`. The sweep
//! flips it to `ZeroRef` only if it is still unreferenced at that point,
//! which closes the window where a concurrent backup re-references the
//! same content between the decrement and the sweep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sidb_core::{ChunkId, Signature, SignatureRef, StoreId, SubstoreId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureState {
    Live,
    /// Count reached zero; waiting for the sweep to confirm
    Marked { at: DateTime<Utc> },
    /// Confirmed unreferenced; chunk may be reclaimed
    ZeroRef { since: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub chunk: ChunkId,
    pub ref_count: u64,
    pub state: SignatureState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstoreStatus {
    Online,
    /// Marked for recovery; waiting for reconstruction
    Offline,
}

impl SubstoreStatus {
    /// Status code as reported by `idxSidbSubStore` (0 online, 1 offline)
    pub fn code(&self) -> i32 {
        match self {
            SubstoreStatus::Online => 0,
            SubstoreStatus::Offline => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Substore {
    pub store: StoreId,
    pub id: SubstoreId,
    pub path: String,
    pub media_agent: String,
    pub status: SubstoreStatus,
    signatures: HashMap<Signature, SignatureEntry>,
}

impl Substore {
    fn check_online(&self) -> StorageResult<()> {
        if self.status == SubstoreStatus::Offline {
            return Err(StorageError::SubstoreOffline {
                store: self.store,
                substore: self.id,
            });
        }
        Ok(())
    }

    fn zero_ref_count(&self) -> u64 {
        self.signatures
            .values()
            .filter(|e| matches!(e.state, SignatureState::ZeroRef { .. }))
            .count() as u64
    }

    fn marked_count(&self) -> u64 {
        self.signatures
            .values()
            .filter(|e| matches!(e.state, SignatureState::Marked { .. }))
            .count() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub id: StoreId,
    pub name: String,
    pub sealed: bool,
    pub substores: Vec<SubstoreId>,
    pub created_at: DateTime<Utc>,
}

/// How a chunk's signatures stand for reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimability {
    /// Every signature held by the chunk is confirmed zero-ref (or gone)
    Reclaimable,
    /// At least one signature awaits sweep confirmation
    Pending,
    /// At least one signature is still referenced
    Referenced,
}

/// Entries removed by a reclaim, kept so a failed delete can put them back
#[derive(Debug, Clone)]
pub struct ReclaimedEntries {
    store: StoreId,
    entries: Vec<(SubstoreId, Signature, SignatureEntry)>,
}

impl ReclaimedEntries {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What one commit step did to an entry
#[derive(Debug, Clone, Copy)]
enum CommitStep {
    Inserted,
    Incremented { previous: SignatureState },
}

enum Reclaim {
    Skip,
    Taken(SignatureEntry),
    Held,
}

/// Persisted form of the whole index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupSnapshot {
    pub stores: Vec<StoreInfo>,
    pub substores: Vec<Substore>,
}

pub struct DedupStore {
    stores: DashMap<StoreId, StoreInfo>,
    substores: DashMap<(StoreId, SubstoreId), Substore>,
    next_store: AtomicU64,
    next_substore: AtomicU64,
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupStore {
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
            substores: DashMap::new(),
            next_store: AtomicU64::new(1),
            next_substore: AtomicU64::new(1),
        }
    }

    pub fn create_store(&self, name: &str) -> StoreId {
        let id = StoreId(self.next_store.fetch_add(1, Ordering::SeqCst));
        self.stores.insert(
            id,
            StoreInfo {
                id,
                name: name.to_string(),
                sealed: false,
                substores: Vec::new(),
                created_at: Utc::now(),
            },
        );
        info!("Created dedup store {} ({})", id, name);
        id
    }

    pub fn store_info(&self, store: StoreId) -> StorageResult<StoreInfo> {
        self.stores
            .get(&store)
            .map(|s| s.clone())
            .ok_or(StorageError::StoreNotFound(store))
    }

    pub fn stores(&self) -> Vec<StoreId> {
        let mut ids: Vec<_> = self.stores.iter().map(|s| s.id).collect();
        ids.sort();
        ids
    }

    pub fn substores(&self, store: StoreId) -> StorageResult<Vec<SubstoreId>> {
        Ok(self.store_info(store)?.substores)
    }

    /// Add a partition to a store.
    ///
    /// Re-using a path already held by a partition of the same store fails
    /// unless `allow_path_reuse` is set, in which case the existing
    /// partition is returned.
    #[instrument(skip(self))]
    pub fn add_partition(
        &self,
        store: StoreId,
        path: &str,
        media_agent: &str,
        allow_path_reuse: bool,
    ) -> StorageResult<SubstoreId> {
        let mut info = self
            .stores
            .get_mut(&store)
            .ok_or(StorageError::StoreNotFound(store))?;

        for existing in &info.substores {
            let same_path = self
                .substores
                .get(&(store, *existing))
                .map(|s| s.path == path)
                .unwrap_or(false);
            if same_path {
                if allow_path_reuse {
                    return Ok(*existing);
                }
                return Err(StorageError::PartitionPathInUse {
                    store,
                    path: path.to_string(),
                });
            }
        }

        let id = SubstoreId(self.next_substore.fetch_add(1, Ordering::SeqCst));
        self.substores.insert(
            (store, id),
            Substore {
                store,
                id,
                path: path.to_string(),
                media_agent: media_agent.to_string(),
                status: SubstoreStatus::Online,
                signatures: HashMap::new(),
            },
        );
        info.substores.push(id);
        info!("Added partition {} to store {} at {}", id, store, path);
        Ok(id)
    }

    pub fn seal_store(&self, store: StoreId) -> StorageResult<()> {
        let mut info = self
            .stores
            .get_mut(&store)
            .ok_or(StorageError::StoreNotFound(store))?;
        info.sealed = true;
        info!("Sealed dedup store {}", store);
        Ok(())
    }

    pub fn is_sealed(&self, store: StoreId) -> StorageResult<bool> {
        Ok(self.store_info(store)?.sealed)
    }

    fn check_writable(&self, store: StoreId) -> StorageResult<()> {
        if self.store_info(store)?.sealed {
            return Err(StorageError::StoreSealed(store));
        }
        Ok(())
    }

    fn with_substore<T>(
        &self,
        store: StoreId,
        substore: SubstoreId,
        f: impl FnOnce(&mut Substore) -> StorageResult<T>,
    ) -> StorageResult<T> {
        if !self.stores.contains_key(&store) {
            return Err(StorageError::StoreNotFound(store));
        }
        let mut entry = self
            .substores
            .get_mut(&(store, substore))
            .ok_or(StorageError::SubstoreNotFound { store, substore })?;
        f(&mut entry)
    }

    pub fn substore_status(
        &self,
        store: StoreId,
        substore: SubstoreId,
    ) -> StorageResult<SubstoreStatus> {
        self.with_substore(store, substore, |s| Ok(s.status))
    }

    pub fn set_substore_status(
        &self,
        store: StoreId,
        substore: SubstoreId,
        status: SubstoreStatus,
    ) -> StorageResult<()> {
        self.with_substore(store, substore, |s| {
            s.status = status;
            Ok(())
        })
    }

    /// Substore currently indexing `signature`, if any
    pub fn locate(
        &self,
        store: StoreId,
        signature: &Signature,
    ) -> StorageResult<Option<(SubstoreId, SignatureEntry)>> {
        for substore in self.substores(store)? {
            if let Some(sub) = self.substores.get(&(store, substore)) {
                if let Some(entry) = sub.signatures.get(signature) {
                    return Ok(Some((substore, entry.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Substore that holds or would receive `signature`
    pub fn route(&self, store: StoreId, signature: &Signature) -> StorageResult<SubstoreId> {
        if let Some((substore, _)) = self.locate(store, signature)? {
            return Ok(substore);
        }
        let substores = self.substores(store)?;
        if substores.is_empty() {
            return Err(StorageError::InvalidState(format!(
                "store {} has no partitions",
                store
            )));
        }
        Ok(substores[signature.partition_index(substores.len())])
    }

    /// Add one reference to an indexed signature; returns the chunk the
    /// index attributes it to.
    ///
    /// A `Marked` or `ZeroRef` signature becomes `Live` again: its chunk
    /// has not been reclaimed yet, so the data is still on disk.
    pub fn increment_reference(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> StorageResult<ChunkId> {
        self.check_writable(store)?;
        self.with_substore(store, substore, |sub| {
            sub.check_online()?;
            let entry = sub.signatures.get_mut(signature).ok_or_else(|| {
                StorageError::SignatureNotIndexed {
                    store,
                    signature: signature.to_hex(),
                }
            })?;
            if entry.state != SignatureState::Live {
                debug!("Signature {:?} referenced again before reclaim", signature);
            }
            entry.ref_count += 1;
            entry.state = SignatureState::Live;
            Ok(entry.chunk)
        })
    }

    /// Index a new signature or add a reference to an existing one
    fn insert_or_increment(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
        chunk: ChunkId,
    ) -> StorageResult<CommitStep> {
        self.with_substore(store, substore, |sub| {
            sub.check_online()?;
            let step = match sub.signatures.get_mut(signature) {
                Some(entry) => {
                    let previous = entry.state;
                    entry.ref_count += 1;
                    entry.state = SignatureState::Live;
                    CommitStep::Incremented { previous }
                }
                None => {
                    sub.signatures.insert(
                        *signature,
                        SignatureEntry {
                            chunk,
                            ref_count: 1,
                            state: SignatureState::Live,
                        },
                    );
                    CommitStep::Inserted
                }
            };
            Ok(step)
        })
    }

    /// Undo one commit step. An entry the commit created is dropped again
    /// unless another writer referenced it meanwhile. Skips the online
    /// check.
    fn undo_commit_step(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
        step: CommitStep,
    ) -> StorageResult<()> {
        self.with_substore(store, substore, |sub| {
            let entry = sub.signatures.get_mut(signature).ok_or_else(|| {
                StorageError::SignatureNotIndexed {
                    store,
                    signature: signature.to_hex(),
                }
            })?;
            if entry.ref_count == 0 {
                return Err(StorageError::InvalidState(format!(
                    "reference count underflow for {}",
                    signature
                )));
            }
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return Ok(());
            }
            match step {
                CommitStep::Incremented { previous } => entry.state = previous,
                CommitStep::Inserted => {
                    sub.signatures.remove(signature);
                }
            }
            Ok(())
        })
    }

    /// Remove one reference. At zero the signature is marked with a
    /// timestamp; returns whether it reached zero.
    pub fn decrement_reference(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> StorageResult<bool> {
        self.with_substore(store, substore, |sub| {
            sub.check_online()?;
            let entry = sub.signatures.get_mut(signature).ok_or_else(|| {
                StorageError::SignatureNotIndexed {
                    store,
                    signature: signature.to_hex(),
                }
            })?;
            if entry.ref_count == 0 {
                return Err(StorageError::InvalidState(format!(
                    "reference count underflow for {}",
                    signature
                )));
            }
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entry.state = SignatureState::Marked { at: Utc::now() };
                return Ok(true);
            }
            Ok(false)
        })
    }

    /// Commit the references a completed job made, all or nothing.
    ///
    /// On failure every applied step is undone in reverse order, leaving
    /// the index as it was before the call.
    #[instrument(skip(self, refs), fields(count = refs.len()))]
    pub fn commit_references(&self, store: StoreId, refs: &[SignatureRef]) -> StorageResult<()> {
        self.check_writable(store)?;

        let mut applied: Vec<(&SignatureRef, CommitStep)> = Vec::with_capacity(refs.len());
        for r in refs {
            match self.insert_or_increment(store, r.substore, &r.signature, r.chunk) {
                Ok(step) => applied.push((r, step)),
                Err(e) => {
                    warn!("Rolling back {} reference increments: {}", applied.len(), e);
                    for (undo, step) in applied.into_iter().rev() {
                        if let Err(undo_err) =
                            self.undo_commit_step(store, undo.substore, &undo.signature, step)
                        {
                            warn!("Failed to roll back reference to {}: {}", undo.signature, undo_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Release the references of one deletion entry, all or nothing.
    ///
    /// Returns how many signatures reached zero.
    pub fn release_references(&self, store: StoreId, refs: &[SignatureRef]) -> StorageResult<u64> {
        self.ensure_online(store, refs)?;

        let mut marked = 0;
        for (applied, r) in refs.iter().enumerate() {
            match self.decrement_reference(store, r.substore, &r.signature) {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Rolling back {} reference decrements: {}", applied, e);
                    for undo in &refs[..applied] {
                        if let Err(undo_err) =
                            self.restore_reference(store, undo.substore, &undo.signature)
                        {
                            warn!("Failed to restore reference to {}: {}", undo.signature, undo_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(marked)
    }

    /// Undo a decrement; bypasses the sealed check
    fn restore_reference(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> StorageResult<()> {
        self.with_substore(store, substore, |sub| {
            if let Some(entry) = sub.signatures.get_mut(signature) {
                entry.ref_count += 1;
                entry.state = SignatureState::Live;
            }
            Ok(())
        })
    }

    fn ensure_online(&self, store: StoreId, refs: &[SignatureRef]) -> StorageResult<()> {
        let mut seen = Vec::new();
        for r in refs {
            if seen.contains(&r.substore) {
                continue;
            }
            seen.push(r.substore);
            if self.substore_status(store, r.substore)? == SubstoreStatus::Offline {
                return Err(StorageError::SubstoreOffline {
                    store,
                    substore: r.substore,
                });
            }
        }
        Ok(())
    }

    /// Sweep step: flip every still-unreferenced `Marked` signature to
    /// `ZeroRef`. Offline substores are skipped.
    #[instrument(skip(self))]
    pub fn confirm_zero_refs(&self, store: StoreId) -> StorageResult<u64> {
        let now = Utc::now();
        let mut confirmed = 0;
        for substore in self.substores(store)? {
            confirmed += self.with_substore(store, substore, |sub| {
                if sub.status == SubstoreStatus::Offline {
                    return Ok(0);
                }
                let mut count = 0;
                for entry in sub.signatures.values_mut() {
                    if matches!(entry.state, SignatureState::Marked { .. }) && entry.ref_count == 0
                    {
                        entry.state = SignatureState::ZeroRef { since: now };
                        count += 1;
                    }
                }
                Ok(count)
            })?;
        }
        if confirmed > 0 {
            debug!("Confirmed {} zero-ref signatures in store {}", confirmed, store);
        }
        Ok(confirmed)
    }

    /// Confirmed zero-ref signatures in a substore
    pub fn zero_ref_count(&self, store: StoreId, substore: SubstoreId) -> StorageResult<u64> {
        self.with_substore(store, substore, |sub| Ok(sub.zero_ref_count()))
    }

    /// Signatures at zero that the sweep has not confirmed yet
    pub fn marked_count(&self, store: StoreId, substore: SubstoreId) -> StorageResult<u64> {
        self.with_substore(store, substore, |sub| Ok(sub.marked_count()))
    }

    pub fn store_zero_ref_count(&self, store: StoreId) -> StorageResult<u64> {
        let mut total = 0;
        for substore in self.substores(store)? {
            total += self.zero_ref_count(store, substore)?;
        }
        Ok(total)
    }

    /// Unique signatures still referenced (primary records)
    pub fn primary_record_count(&self, store: StoreId) -> StorageResult<u64> {
        self.sum_over(store, |e| u64::from(e.ref_count > 0))
    }

    /// References beyond the first per signature (secondary records)
    pub fn secondary_record_count(&self, store: StoreId) -> StorageResult<u64> {
        self.sum_over(store, |e| e.ref_count.saturating_sub(1))
    }

    fn sum_over(&self, store: StoreId, f: impl Fn(&SignatureEntry) -> u64) -> StorageResult<u64> {
        let mut total = 0;
        for substore in self.substores(store)? {
            total += self.with_substore(store, substore, |sub| {
                Ok(sub.signatures.values().map(&f).sum::<u64>())
            })?;
        }
        Ok(total)
    }

    pub fn reference_count(&self, store: StoreId, signature: &Signature) -> StorageResult<u64> {
        Ok(self
            .locate(store, signature)?
            .map(|(_, e)| e.ref_count)
            .unwrap_or(0))
    }

    /// Classify a chunk by the signatures the index attributes to it.
    /// Signatures no longer indexed, or indexed against another chunk,
    /// do not hold the chunk.
    pub fn chunk_reclaimability(
        &self,
        store: StoreId,
        chunk: ChunkId,
        signatures: &[Signature],
    ) -> StorageResult<Reclaimability> {
        let mut result = Reclaimability::Reclaimable;
        for signature in signatures {
            let Some((_, entry)) = self.locate(store, signature)? else {
                continue;
            };
            if entry.chunk != chunk {
                continue;
            }
            match entry.state {
                SignatureState::Live => return Ok(Reclaimability::Referenced),
                SignatureState::Marked { .. } => result = Reclaimability::Pending,
                SignatureState::ZeroRef { .. } => {}
            }
        }
        Ok(result)
    }

    /// Drop a chunk's zero-ref signatures from the index so no writer can
    /// deduplicate against it while its folder is deleted.
    ///
    /// Returns `None`, with nothing removed, if any of them was referenced
    /// again in the meantime.
    pub fn reclaim_chunk(
        &self,
        store: StoreId,
        chunk: ChunkId,
        signatures: &[Signature],
    ) -> StorageResult<Option<ReclaimedEntries>> {
        let mut removed = ReclaimedEntries {
            store,
            entries: Vec::new(),
        };

        for signature in signatures {
            let Some((substore, _)) = self.locate(store, signature)? else {
                continue;
            };
            let outcome = self.with_substore(store, substore, |sub| {
                let held = match sub.signatures.get(signature) {
                    None => return Ok(Reclaim::Skip),
                    Some(e) if e.chunk != chunk => return Ok(Reclaim::Skip),
                    Some(e) => !matches!(e.state, SignatureState::ZeroRef { .. }),
                };
                if held {
                    return Ok(Reclaim::Held);
                }
                Ok(sub
                    .signatures
                    .remove(signature)
                    .map(Reclaim::Taken)
                    .unwrap_or(Reclaim::Skip))
            })?;

            match outcome {
                Reclaim::Skip => {}
                Reclaim::Taken(entry) => removed.entries.push((substore, *signature, entry)),
                Reclaim::Held => {
                    self.restore_entries(removed);
                    return Ok(None);
                }
            }
        }
        Ok(Some(removed))
    }

    /// Put reclaimed entries back after a failed physical delete
    pub fn restore_entries(&self, reclaimed: ReclaimedEntries) {
        for (substore, signature, entry) in reclaimed.entries {
            if let Some(mut sub) = self.substores.get_mut(&(reclaimed.store, substore)) {
                sub.signatures.entry(signature).or_insert(entry);
            }
        }
    }

    /// Replace a substore's index with counts rebuilt from committed job
    /// references and bring it back online
    #[instrument(skip(self, counts), fields(signatures = counts.len()))]
    pub fn rebuild_substore(
        &self,
        store: StoreId,
        substore: SubstoreId,
        counts: HashMap<Signature, (ChunkId, u64)>,
    ) -> StorageResult<()> {
        self.with_substore(store, substore, |sub| {
            sub.signatures = counts
                .into_iter()
                .filter(|(_, (_, count))| *count > 0)
                .map(|(signature, (chunk, ref_count))| {
                    (
                        signature,
                        SignatureEntry {
                            chunk,
                            ref_count,
                            state: SignatureState::Live,
                        },
                    )
                })
                .collect();
            sub.status = SubstoreStatus::Online;
            Ok(())
        })?;
        info!("Reconstructed substore {}/{}", store, substore);
        Ok(())
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        let mut stores: Vec<_> = self.stores.iter().map(|s| s.clone()).collect();
        stores.sort_by_key(|s| s.id);
        let mut substores: Vec<_> = self.substores.iter().map(|s| s.clone()).collect();
        substores.sort_by_key(|s| (s.store, s.id));
        DedupSnapshot { stores, substores }
    }

    pub fn restore(&self, snapshot: DedupSnapshot) {
        self.stores.clear();
        self.substores.clear();
        let mut max_store = 0;
        let mut max_substore = 0;
        for store in snapshot.stores {
            max_store = max_store.max(store.id.get());
            self.stores.insert(store.id, store);
        }
        for substore in snapshot.substores {
            max_substore = max_substore.max(substore.id.get());
            self.substores.insert((substore.store, substore.id), substore);
        }
        self.next_store.store(max_store + 1, Ordering::SeqCst);
        self.next_substore.store(max_substore + 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str) -> Signature {
        Signature::from_data(name.as_bytes())
    }

    fn setup() -> (DedupStore, StoreId, SubstoreId) {
        let dedup = DedupStore::new();
        let store = dedup.create_store("S");
        let p1 = dedup.add_partition(store, "/ddb/p1", "ma1", false).unwrap();
        (dedup, store, p1)
    }

    fn sref(substore: SubstoreId, name: &str, chunk: u64) -> SignatureRef {
        SignatureRef {
            substore,
            signature: sig(name),
            chunk: ChunkId(chunk),
        }
    }

    #[test]
    fn test_unknown_store() {
        let dedup = DedupStore::new();
        let err = dedup
            .increment_reference(StoreId(9), SubstoreId(1), &sig("sig-1"))
            .unwrap_err();
        assert!(matches!(err, StorageError::StoreNotFound(_)));

        let (dedup, store, _) = setup();
        let err = dedup.zero_ref_count(store, SubstoreId(99)).unwrap_err();
        assert!(matches!(err, StorageError::SubstoreNotFound { .. }));
    }

    #[test]
    fn test_partition_path_reuse() {
        let (dedup, store, p1) = setup();
        assert!(matches!(
            dedup.add_partition(store, "/ddb/p1", "ma1", false),
            Err(StorageError::PartitionPathInUse { .. })
        ));
        assert_eq!(dedup.add_partition(store, "/ddb/p1", "ma1", true).unwrap(), p1);

        let p2 = dedup.add_partition(store, "/ddb/p2", "ma2", false).unwrap();
        assert_ne!(p1, p2);
        assert_eq!(dedup.substores(store).unwrap(), vec![p1, p2]);
    }

    #[test]
    fn test_zero_ref_needs_sweep() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "sig-1", 1)]).unwrap();
        assert_eq!(dedup.reference_count(store, &sig("sig-1")).unwrap(), 1);

        assert!(dedup.decrement_reference(store, p1, &sig("sig-1")).unwrap());
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 0);
        assert_eq!(dedup.marked_count(store, p1).unwrap(), 1);

        assert_eq!(dedup.confirm_zero_refs(store).unwrap(), 1);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 1);

        // Second sweep changes nothing
        assert_eq!(dedup.confirm_zero_refs(store).unwrap(), 0);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 1);
    }

    #[test]
    fn test_writer_between_mark_and_sweep() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "sig-1", 1)]).unwrap();
        dedup.decrement_reference(store, p1, &sig("sig-1")).unwrap();

        dedup.increment_reference(store, p1, &sig("sig-1")).unwrap();
        assert_eq!(dedup.confirm_zero_refs(store).unwrap(), 0);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 0);
        assert_eq!(
            dedup
                .chunk_reclaimability(store, ChunkId(1), &[sig("sig-1")])
                .unwrap(),
            Reclaimability::Referenced
        );
    }

    #[test]
    fn test_underflow_rejected() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "sig-1", 1)]).unwrap();
        dedup.decrement_reference(store, p1, &sig("sig-1")).unwrap();
        assert!(matches!(
            dedup.decrement_reference(store, p1, &sig("sig-1")),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn test_release_rolls_back_on_error() {
        let (dedup, store, p1) = setup();
        dedup
            .commit_references(store, &[sref(p1, "a", 1), sref(p1, "b", 1)])
            .unwrap();

        // "missing" was never indexed; the decrement of "a" must be undone
        let refs = [sref(p1, "a", 1), sref(p1, "missing", 1)];
        assert!(dedup.release_references(store, &refs).is_err());
        assert_eq!(dedup.reference_count(store, &sig("a")).unwrap(), 1);
        assert_eq!(dedup.marked_count(store, p1).unwrap(), 0);
    }

    #[test]
    fn test_commit_rolls_back_across_substores() {
        let (dedup, store, p1) = setup();
        let p2 = dedup.add_partition(store, "/ddb/p2", "ma2", false).unwrap();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup
            .set_substore_status(store, p2, SubstoreStatus::Offline)
            .unwrap();

        let refs = [sref(p1, "a", 2), sref(p1, "new", 2), sref(p2, "b", 2)];
        let err = dedup.commit_references(store, &refs).unwrap_err();
        assert!(matches!(err, StorageError::SubstoreOffline { .. }));

        assert_eq!(dedup.reference_count(store, &sig("a")).unwrap(), 1);
        assert!(dedup.locate(store, &sig("new")).unwrap().is_none());
        assert_eq!(dedup.marked_count(store, p1).unwrap(), 0);
        assert_eq!(dedup.primary_record_count(store).unwrap(), 1);
    }

    #[test]
    fn test_commit_rollback_restores_zero_ref_state() {
        let (dedup, store, p1) = setup();
        let p2 = dedup.add_partition(store, "/ddb/p2", "ma2", false).unwrap();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup.release_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup.confirm_zero_refs(store).unwrap();
        dedup
            .set_substore_status(store, p2, SubstoreStatus::Offline)
            .unwrap();

        assert!(dedup
            .commit_references(store, &[sref(p1, "a", 1), sref(p2, "b", 2)])
            .is_err());
        assert_eq!(dedup.reference_count(store, &sig("a")).unwrap(), 0);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 1);
        assert_eq!(dedup.marked_count(store, p1).unwrap(), 0);
    }

    #[test]
    fn test_increment_reports_indexed_chunk() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "a", 4)]).unwrap();
        assert_eq!(
            dedup.increment_reference(store, p1, &sig("a")).unwrap(),
            ChunkId(4)
        );
    }

    #[test]
    fn test_offline_substore() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup
            .set_substore_status(store, p1, SubstoreStatus::Offline)
            .unwrap();
        assert_eq!(dedup.substore_status(store, p1).unwrap().code(), 1);

        let err = dedup.increment_reference(store, p1, &sig("a")).unwrap_err();
        assert!(err.is_transient());
        assert!(dedup.release_references(store, &[sref(p1, "a", 1)]).is_err());
        assert_eq!(dedup.reference_count(store, &sig("a")).unwrap(), 1);
    }

    #[test]
    fn test_sealed_store_rejects_references() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup.seal_store(store).unwrap();
        assert!(matches!(
            dedup.increment_reference(store, p1, &sig("a")),
            Err(StorageError::StoreSealed(_))
        ));
        // Pruning still releases references
        assert_eq!(dedup.release_references(store, &[sref(p1, "a", 1)]).unwrap(), 1);
    }

    #[test]
    fn test_reclaim_and_restore() {
        let (dedup, store, p1) = setup();
        let refs = [sref(p1, "a", 1), sref(p1, "b", 1)];
        dedup.commit_references(store, &refs).unwrap();
        dedup.release_references(store, &refs).unwrap();
        dedup.confirm_zero_refs(store).unwrap();

        let sigs = [sig("a"), sig("b")];
        let reclaimed = dedup.reclaim_chunk(store, ChunkId(1), &sigs).unwrap().unwrap();
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 0);
        assert!(dedup.locate(store, &sig("a")).unwrap().is_none());

        dedup.restore_entries(reclaimed);
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 2);
    }

    #[test]
    fn test_reclaim_refused_when_referenced() {
        let (dedup, store, p1) = setup();
        let refs = [sref(p1, "a", 1), sref(p1, "b", 1)];
        dedup.commit_references(store, &refs).unwrap();
        dedup.release_references(store, &refs).unwrap();
        dedup.confirm_zero_refs(store).unwrap();
        dedup.increment_reference(store, p1, &sig("b")).unwrap();

        let sigs = [sig("a"), sig("b")];
        assert!(dedup.reclaim_chunk(store, ChunkId(1), &sigs).unwrap().is_none());
        // Nothing was removed
        assert!(dedup.locate(store, &sig("a")).unwrap().is_some());
        assert_eq!(dedup.zero_ref_count(store, p1).unwrap(), 1);
    }

    #[test]
    fn test_record_counts() {
        let (dedup, store, p1) = setup();
        dedup
            .commit_references(
                store,
                &[sref(p1, "a", 1), sref(p1, "a", 1), sref(p1, "a", 1), sref(p1, "b", 1)],
            )
            .unwrap();
        assert_eq!(dedup.primary_record_count(store).unwrap(), 2);
        assert_eq!(dedup.secondary_record_count(store).unwrap(), 2);
    }

    #[test]
    fn test_rebuild_substore() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        dedup
            .set_substore_status(store, p1, SubstoreStatus::Offline)
            .unwrap();

        let mut counts = HashMap::new();
        counts.insert(sig("a"), (ChunkId(1), 3));
        counts.insert(sig("gone"), (ChunkId(2), 0));
        dedup.rebuild_substore(store, p1, counts).unwrap();

        assert_eq!(dedup.substore_status(store, p1).unwrap(), SubstoreStatus::Online);
        assert_eq!(dedup.reference_count(store, &sig("a")).unwrap(), 3);
        assert!(dedup.locate(store, &sig("gone")).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let (dedup, store, p1) = setup();
        dedup.commit_references(store, &[sref(p1, "a", 1)]).unwrap();
        let json = serde_json::to_string(&dedup.snapshot()).unwrap();

        let restored = DedupStore::new();
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.reference_count(store, &sig("a")).unwrap(), 1);
        assert_ne!(restored.create_store("T"), store);
    }
}
