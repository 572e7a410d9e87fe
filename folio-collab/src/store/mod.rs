//! Replica-local block store.
//!
//! Architecture:
//! ```text
//!  local patch ──► insert_or_merge ─┐                 ┌──► inserts
//!                                   ├─► merge ─► commit ├──► updates
//!  remote block ──► merge_remote ───┘   (memory) (backend) └──► removals
//! ```
//!
//! Every write is computed in memory first, committed to the backend, and
//! only then published to the in-memory map and the subscribers. A failed
//! commit leaves both the durable and the in-memory state untouched.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

pub mod backend;
pub mod rocks;

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use folio_core::codec::DocumentSnapshot;
use folio_core::{Block, BlockId, BlockPatch, BlockView, ClockError, LamportClock, ReplicaId};
use thiserror::Error;
use tokio::sync::broadcast;

pub use backend::{BlockBackend, Commit, MemoryBackend};
pub use rocks::{RocksBackend, StoreConfig};

/// Capacity of each notification channel.
pub const NOTIFICATION_CAPACITY: usize = 1024;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Block not found: {0}")]
    NotFound(BlockId),
    /// Backend I/O failed; nothing was written
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    /// The write would push the Lamport clock out of range
    #[error(transparent)]
    Clock(#[from] ClockError),
}

/// One effective change, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    pub block: Block,
    /// Replica whose write produced the change: the local replica for local
    /// writes, the delivering peer for merged remote state.
    pub writer: ReplicaId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Insert,
    Update,
    Removal,
}

/// Classify the transition `before → after`; `None` when nothing changed.
fn classify(before: Option<&Block>, after: &Block) -> Option<ChangeKind> {
    if before == Some(after) {
        return None;
    }
    let was_visible = before.is_some_and(|b| !b.deleted);
    match (was_visible, !after.deleted) {
        (false, true) => Some(ChangeKind::Insert),
        (true, false) => Some(ChangeKind::Removal),
        _ => Some(ChangeKind::Update),
    }
}

struct StoreState {
    blocks: HashMap<BlockId, Block>,
    clock: LamportClock,
}

/// The block store of one replica.
pub struct BlockStore {
    replica: ReplicaId,
    state: RwLock<StoreState>,
    backend: Box<dyn BlockBackend>,
    inserts: broadcast::Sender<BlockChange>,
    updates: broadcast::Sender<BlockChange>,
    removals: broadcast::Sender<BlockChange>,
}

impl BlockStore {
    /// Open a store over `backend`, recovering its blocks and clock.
    pub fn open(replica: ReplicaId, backend: Box<dyn BlockBackend>) -> Result<Self, StoreError> {
        let blocks = backend.load_blocks()?;
        let stored_clock = backend.load_clock()?;
        let time = blocks
            .iter()
            .map(|b| b.latest_stamp().clock)
            .fold(stored_clock, u64::max);

        log::info!(
            "Recovered {} blocks from {} backend (clock {time})",
            blocks.len(),
            backend.name()
        );

        let blocks = blocks.into_iter().map(|b| (b.id.clone(), b)).collect();
        Ok(Self::with_state(replica.clone(), backend, blocks, LamportClock::resume(replica, time)))
    }

    /// A fresh store over a [`MemoryBackend`].
    pub fn in_memory(replica: ReplicaId) -> Self {
        Self::with_state(
            replica.clone(),
            Box::new(MemoryBackend::new()),
            HashMap::new(),
            LamportClock::new(replica),
        )
    }

    /// Open a RocksDB-backed store.
    pub fn open_rocks(replica: ReplicaId, config: StoreConfig) -> Result<Self, StoreError> {
        Self::open(replica, Box::new(RocksBackend::open(config)?))
    }

    fn with_state(
        replica: ReplicaId,
        backend: Box<dyn BlockBackend>,
        blocks: HashMap<BlockId, Block>,
        clock: LamportClock,
    ) -> Self {
        let (inserts, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (updates, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (removals, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            replica,
            state: RwLock::new(StoreState { blocks, clock }),
            backend,
            inserts,
            updates,
            removals,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: ChangeKind, block: &Block, writer: &ReplicaId) {
        let sender = match kind {
            ChangeKind::Insert => &self.inserts,
            ChangeKind::Update => &self.updates,
            ChangeKind::Removal => &self.removals,
        };
        // No subscribers is fine.
        let _ = sender.send(BlockChange {
            block: block.clone(),
            writer: writer.clone(),
        });
    }

    /// Apply a local write: create the block if absent, else patch it.
    pub fn insert_or_merge(&self, patch: BlockPatch) -> Result<Block, StoreError> {
        let mut state = self.write();
        let previous = state.blocks.get(&patch.id).cloned();

        if let (Some(existing), true) = (&previous, patch.is_empty()) {
            return Ok(existing.clone());
        }

        let mut clock = state.clock.clone();
        let stamp = clock.tick()?;
        let next = match &previous {
            Some(existing) => existing.patched(&patch, stamp),
            None => Block::create(&patch, stamp),
        };

        self.backend.commit(Commit {
            writes: vec![&next],
            erases: vec![],
            clock: clock.time(),
        })?;

        state.clock = clock;
        state.blocks.insert(next.id.clone(), next.clone());
        if let Some(kind) = classify(previous.as_ref(), &next) {
            self.notify(kind, &next, &self.replica);
        }
        log::trace!("Local write to {}", next.id);
        Ok(next)
    }

    /// Join a replicated copy of a block delivered by `writer`.
    pub fn merge_remote(&self, block: Block, writer: &ReplicaId) -> Result<Block, StoreError> {
        let mut state = self.write();
        let (merged, changed) = self.merge_into(&mut state, block, writer)?;
        if changed {
            log::trace!("Merged {} from {writer}", merged.id);
        }
        Ok(merged)
    }

    /// Merge under an already held lock. Returns the result and whether it
    /// changed anything.
    fn merge_into(
        &self,
        state: &mut StoreState,
        block: Block,
        writer: &ReplicaId,
    ) -> Result<(Block, bool), StoreError> {
        let mut clock = state.clock.clone();
        if let Err(e) = clock.observe(block.latest_stamp()) {
            log::warn!("Rejecting block {} from {writer}: {e}", block.id);
            return Err(e.into());
        }
        let previous = state.blocks.get(&block.id).cloned();

        let merged = match &previous {
            Some(existing) => existing.merge(&block),
            None => block,
        };
        let Some(kind) = classify(previous.as_ref(), &merged) else {
            state.clock = clock;
            return Ok((merged, false));
        };

        self.backend.commit(Commit {
            writes: vec![&merged],
            erases: vec![],
            clock: clock.time(),
        })?;

        state.clock = clock;
        state.blocks.insert(merged.id.clone(), merged.clone());
        self.notify(kind, &merged, writer);
        Ok((merged, true))
    }

    /// Tombstone a block. Removing an already removed block is a no-op.
    pub fn remove(&self, id: &BlockId) -> Result<Block, StoreError> {
        let mut state = self.write();
        let previous = state
            .blocks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if previous.deleted {
            return Ok(previous);
        }

        let mut clock = state.clock.clone();
        let next = previous.patched(&BlockPatch::new(id.clone()).deleted(true), clock.tick()?);

        self.backend.commit(Commit {
            writes: vec![&next],
            erases: vec![],
            clock: clock.time(),
        })?;

        state.clock = clock;
        state.blocks.insert(id.clone(), next.clone());
        self.notify(ChangeKind::Removal, &next, &self.replica);
        Ok(next)
    }

    /// Look up a block, tombstoned or not.
    pub fn find_by_id(&self, id: &BlockId) -> Option<Block> {
        self.read().blocks.get(id).cloned()
    }

    /// Live blocks ordered by `(index, id)`.
    pub fn find_ordered_by_index(&self) -> Vec<Block> {
        self.snapshot().blocks
    }

    /// Live blocks whose index falls in `range`, ordered by `(index, id)`.
    pub fn find_in_index_range(&self, range: RangeInclusive<i64>) -> Vec<Block> {
        let mut blocks = self.find_ordered_by_index();
        blocks.retain(|b| range.contains(&b.index));
        blocks
    }

    pub fn subscribe_inserts(&self) -> broadcast::Receiver<BlockChange> {
        self.inserts.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<BlockChange> {
        self.updates.subscribe()
    }

    pub fn subscribe_removals(&self) -> broadcast::Receiver<BlockChange> {
        self.removals.subscribe()
    }

    /// Every block including tombstones, ordered by id.
    pub fn export_all(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = self.read().blocks.values().cloned().collect();
        blocks.sort_by(|a, b| a.id.cmp(&b.id));
        blocks
    }

    /// Merge a batch of blocks as this replica's own import.
    ///
    /// Returns how many blocks changed. Blocks with out-of-range stamps are
    /// skipped. Stops at the first failed commit;
    /// blocks merged before it stay merged.
    pub fn import_all<I>(&self, blocks: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Block>,
    {
        let mut state = self.write();
        let mut changed = 0;
        for block in blocks {
            match self.merge_into(&mut state, block, &self.replica) {
                Ok((_, true)) => changed += 1,
                Ok((_, false)) | Err(StoreError::Clock(_)) => {}
                Err(e) => return Err(e),
            }
        }
        log::debug!("Imported {changed} changed blocks");
        Ok(changed)
    }

    /// Snapshot of the live document.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot::from_blocks(self.read().blocks.values().cloned())
    }

    /// What the editing surface persists: the ordered live blocks.
    pub fn save(&self) -> Vec<BlockView> {
        self.find_ordered_by_index().iter().map(Block::view).collect()
    }

    /// Physically erase tombstones. Returns how many were erased.
    pub fn compact(&self) -> Result<usize, StoreError> {
        let mut state = self.write();
        let tombstones: Vec<BlockId> = state
            .blocks
            .values()
            .filter(|b| b.deleted)
            .map(|b| b.id.clone())
            .collect();
        if tombstones.is_empty() {
            return Ok(0);
        }

        self.backend.commit(Commit {
            writes: vec![],
            erases: tombstones.iter().collect(),
            clock: state.clock.time(),
        })?;

        for id in &tombstones {
            state.blocks.remove(id);
        }
        log::info!("Compacted {} tombstones", tombstones.len());
        Ok(tombstones.len())
    }

    /// Drop every block, live or not ("new notebook"). Subscribers are not
    /// notified; the caller resets its view. The clock keeps running.
    pub fn purge(&self) -> Result<usize, StoreError> {
        let mut state = self.write();
        self.backend.clear()?;
        let count = state.blocks.len();
        state.blocks.clear();
        log::info!("Purged {count} blocks");
        Ok(count)
    }

    /// Number of blocks, tombstones included.
    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current Lamport time.
    pub fn clock(&self) -> u64 {
        self.read().clock.time()
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{Payload, Stamp};
    use serde_json::json;
    use std::sync::Arc;

    fn replica(s: &str) -> ReplicaId {
        ReplicaId::from(s)
    }

    fn text(s: &str) -> Payload {
        Payload::from(json!({ "text": s }))
    }

    #[test]
    fn test_insert_then_find() {
        let store = BlockStore::in_memory(replica("a"));
        let block = store
            .insert_or_merge(BlockPatch::new("b1").data(text("hi")).index(3))
            .unwrap();
        assert_eq!(block.created_by, replica("a"));
        assert_eq!(store.find_by_id(&BlockId::from("b1")), Some(block));
        assert_eq!(store.clock(), 1);
    }

    #[test]
    fn test_patch_keeps_other_fields() {
        let store = BlockStore::in_memory(replica("a"));
        store
            .insert_or_merge(BlockPatch::new("b1").kind("code").data(text("x")))
            .unwrap();
        let block = store.insert_or_merge(BlockPatch::new("b1").index(5)).unwrap();
        assert_eq!(block.kind, "code");
        assert_eq!(block.data, text("x"));
        assert_eq!(block.index, 5);
    }

    #[test]
    fn test_ordered_excludes_tombstones() {
        let store = BlockStore::in_memory(replica("a"));
        for (id, index) in [("c", 2), ("a", 1), ("b", 1), ("d", 0)] {
            store.insert_or_merge(BlockPatch::new(id).index(index)).unwrap();
        }
        store.remove(&BlockId::from("a")).unwrap();

        let ids: Vec<String> = store
            .find_ordered_by_index()
            .into_iter()
            .map(|b| b.id.to_string())
            .collect();
        assert_eq!(ids, vec!["d", "b", "c"]);
        assert_eq!(store.len(), 4);

        let ranged: Vec<String> = store
            .find_in_index_range(1..=2)
            .into_iter()
            .map(|b| b.id.to_string())
            .collect();
        assert_eq!(ranged, vec!["b", "c"]);
    }

    #[test]
    fn test_remove_unknown() {
        let store = BlockStore::in_memory(replica("a"));
        assert_eq!(
            store.remove(&BlockId::from("ghost")),
            Err(StoreError::NotFound(BlockId::from("ghost")))
        );
    }

    #[test]
    fn test_remove_records_local_editor() {
        let store = BlockStore::in_memory(replica("a"));
        let remote = Block::create(&BlockPatch::new("b1"), Stamp::new(4, replica("z")));
        store.merge_remote(remote, &replica("z")).unwrap();

        let removed = store.remove(&BlockId::from("b1")).unwrap();
        assert!(removed.deleted);
        assert_eq!(removed.last_edited_by, replica("a"));
        assert_eq!(removed.created_by, replica("z"));
        assert!(removed.meta.deleted.clock > 4);
    }

    #[test]
    fn test_notifications_classified() {
        let store = BlockStore::in_memory(replica("a"));
        let mut inserts = store.subscribe_inserts();
        let mut updates = store.subscribe_updates();
        let mut removals = store.subscribe_removals();

        store.insert_or_merge(BlockPatch::new("b1")).unwrap();
        store.insert_or_merge(BlockPatch::new("b1").data(text("x"))).unwrap();
        store.remove(&BlockId::from("b1")).unwrap();
        store
            .insert_or_merge(BlockPatch::new("b1").deleted(false))
            .unwrap();

        assert_eq!(inserts.try_recv().unwrap().writer, replica("a"));
        assert!(!updates.try_recv().unwrap().block.deleted);
        assert!(removals.try_recv().unwrap().block.deleted);
        // Resurrection counts as an insert.
        assert!(!inserts.try_recv().unwrap().block.deleted);
        assert!(inserts.try_recv().is_err());
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_redundant_merge_is_silent() {
        let store = BlockStore::in_memory(replica("a"));
        let remote = Block::create(&BlockPatch::new("b1"), Stamp::new(1, replica("z")));
        let mut inserts = store.subscribe_inserts();
        let mut updates = store.subscribe_updates();

        store.merge_remote(remote.clone(), &replica("z")).unwrap();
        store.merge_remote(remote, &replica("z")).unwrap();

        assert_eq!(inserts.try_recv().unwrap().writer, replica("z"));
        assert!(inserts.try_recv().is_err());
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_merge_remote_advances_clock() {
        let store = BlockStore::in_memory(replica("a"));
        let remote = Block::create(&BlockPatch::new("b1"), Stamp::new(41, replica("z")));
        store.merge_remote(remote, &replica("z")).unwrap();
        assert_eq!(store.clock(), 41);

        // A later local edit supersedes the remote write.
        let edited = store
            .insert_or_merge(BlockPatch::new("b1").data(text("mine")))
            .unwrap();
        assert_eq!(edited.meta.data, Stamp::new(42, replica("a")));
    }

    #[test]
    fn test_out_of_range_stamp_is_rejected() {
        let store = BlockStore::in_memory(replica("a"));
        store.insert_or_merge(BlockPatch::new("x")).unwrap();
        let mut inserts = store.subscribe_inserts();

        let hostile = Block::create(&BlockPatch::new("y"), Stamp::new(u64::MAX, replica("evil")));
        let err = store.merge_remote(hostile.clone(), &replica("evil")).unwrap_err();
        assert!(matches!(err, StoreError::Clock(_)));
        assert!(store.find_by_id(&BlockId::from("y")).is_none());
        assert!(inserts.try_recv().is_err());
        assert_eq!(store.clock(), 1);

        // Imports skip it too, and local writes keep ordering after old ones.
        assert_eq!(store.import_all(vec![hostile]).unwrap(), 0);
        let next = store.insert_or_merge(BlockPatch::new("y")).unwrap();
        assert_eq!(next.meta.data, Stamp::new(2, replica("a")));
    }

    #[test]
    fn test_concurrent_edit_does_not_resurrect() {
        let store = BlockStore::in_memory(replica("a"));
        let base = store.insert_or_merge(BlockPatch::new("b1")).unwrap();
        store.remove(&BlockId::from("b1")).unwrap();

        // Remote edit with a higher clock that never saw the removal.
        let edited = base.patched(&BlockPatch::new("b1").data(text("late")), Stamp::new(99, replica("z")));
        let merged = store.merge_remote(edited, &replica("z")).unwrap();

        assert!(merged.deleted);
        assert_eq!(merged.data, text("late"));
        assert!(store.find_ordered_by_index().is_empty());
    }

    #[test]
    fn test_failed_commit_leaves_state() {
        let backend = Arc::new(MemoryBackend::new());
        let store = BlockStore::open(replica("a"), Box::new(SharedBackend(backend.clone()))).unwrap();
        store.insert_or_merge(BlockPatch::new("b1").data(text("v1"))).unwrap();
        let mut updates = store.subscribe_updates();

        backend.set_available(false);
        let result = store.insert_or_merge(BlockPatch::new("b1").data(text("v2")));
        assert!(matches!(result, Err(StoreError::StorageUnavailable(_))));
        assert_eq!(store.find_by_id(&BlockId::from("b1")).unwrap().data, text("v1"));
        assert_eq!(store.clock(), 1);
        assert!(updates.try_recv().is_err());

        backend.set_available(true);
        let block = store.insert_or_merge(BlockPatch::new("b1").data(text("v2"))).unwrap();
        assert_eq!(block.data, text("v2"));
    }

    #[test]
    fn test_import_export() {
        let source = BlockStore::in_memory(replica("a"));
        source.insert_or_merge(BlockPatch::new("x").index(1)).unwrap();
        source.insert_or_merge(BlockPatch::new("y").index(0)).unwrap();
        source.remove(&BlockId::from("x")).unwrap();

        let target = BlockStore::in_memory(replica("b"));
        assert_eq!(target.import_all(source.export_all()).unwrap(), 2);
        assert_eq!(target.export_all(), source.export_all());
        // Importing again changes nothing.
        assert_eq!(target.import_all(source.export_all()).unwrap(), 0);
    }

    #[test]
    fn test_save_and_snapshot() {
        let store = BlockStore::in_memory(replica("a"));
        store
            .insert_or_merge(BlockPatch::new("p").kind("heading").data(text("T")).index(0))
            .unwrap();
        let views = store.save();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].kind, "heading");
        assert_eq!(store.snapshot().blocks.len(), 1);
    }

    #[test]
    fn test_compact_and_purge() {
        let store = BlockStore::in_memory(replica("a"));
        store.insert_or_merge(BlockPatch::new("a")).unwrap();
        store.insert_or_merge(BlockPatch::new("b")).unwrap();
        store.remove(&BlockId::from("a")).unwrap();

        assert_eq!(store.compact().unwrap(), 1);
        assert_eq!(store.compact().unwrap(), 0);
        assert!(store.find_by_id(&BlockId::from("a")).is_none());

        let clock = store.clock();
        assert_eq!(store.purge().unwrap(), 1);
        assert!(store.is_empty());
        assert_eq!(store.clock(), clock);
    }

    #[test]
    fn test_reopen_recovers_blocks_and_clock() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = BlockStore::open(replica("a"), Box::new(SharedBackend(backend.clone()))).unwrap();
            store.insert_or_merge(BlockPatch::new("b1")).unwrap();
            store.insert_or_merge(BlockPatch::new("b1").index(2)).unwrap();
        }
        let store = BlockStore::open(replica("a"), Box::new(SharedBackend(backend))).unwrap();
        assert_eq!(store.clock(), 2);
        assert_eq!(store.find_by_id(&BlockId::from("b1")).unwrap().index, 2);
    }

    /// Lets a test keep a handle on the backend the store owns.
    struct SharedBackend(Arc<MemoryBackend>);

    impl BlockBackend for SharedBackend {
        fn load_blocks(&self) -> Result<Vec<Block>, StoreError> {
            self.0.load_blocks()
        }
        fn load_clock(&self) -> Result<u64, StoreError> {
            self.0.load_clock()
        }
        fn commit(&self, commit: Commit<'_>) -> Result<(), StoreError> {
            self.0.commit(commit)
        }
        fn clear(&self) -> Result<(), StoreError> {
            self.0.clear()
        }
        fn name(&self) -> &'static str {
            "shared-memory"
        }
    }
}
