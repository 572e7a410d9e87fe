//! Durable backends behind the block store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use folio_core::{Block, BlockId};

use super::StoreError;

/// One atomic commit: blocks to write, ids to erase, and the clock to record.
#[derive(Debug, Default)]
pub struct Commit<'a> {
    pub writes: Vec<&'a Block>,
    pub erases: Vec<&'a BlockId>,
    pub clock: u64,
}

/// Durable storage for a replica's blocks.
///
/// `commit` is all-or-nothing: after an error the backend still holds
/// exactly what it held before.
pub trait BlockBackend: Send + Sync {
    /// Every persisted block, tombstones included.
    fn load_blocks(&self) -> Result<Vec<Block>, StoreError>;

    /// Last committed Lamport time, 0 for a fresh backend.
    fn load_clock(&self) -> Result<u64, StoreError>;

    fn commit(&self, commit: Commit<'_>) -> Result<(), StoreError>;

    /// Erase everything.
    fn clear(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

#[derive(Default)]
struct MemoryState {
    blocks: HashMap<BlockId, Block>,
    clock: u64,
}

/// In-process backend. Can be switched unavailable to exercise failure paths.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `StorageUnavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::StorageUnavailable("memory backend offline".into()));
        }
        Ok(())
    }
}

impl BlockBackend for MemoryBackend {
    fn load_blocks(&self) -> Result<Vec<Block>, StoreError> {
        self.check()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.blocks.values().cloned().collect())
    }

    fn load_clock(&self) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clock)
    }

    fn commit(&self, commit: Commit<'_>) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for block in commit.writes {
            state.blocks.insert(block.id.clone(), block.clone());
        }
        for id in commit.erases {
            state.blocks.remove(id);
        }
        state.clock = state.clock.max(commit.clock);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.blocks.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
