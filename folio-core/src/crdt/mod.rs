//! Merge metadata for convergent block replication.
//!
//! Every replicated block field is a last-writer-wins register. A write is
//! identified by a [`Stamp`]: a Lamport clock value paired with the writing
//! replica. Stamps are totally ordered by `(clock, replica)`, so two replicas
//! that have seen the same set of writes always pick the same winner,
//! whatever order the writes arrived in.
//!
//! Reference: Shapiro et al., A comprehensive study of Convergent and
//! Commutative Replicated Data Types (LWW-Register)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::ReplicaId;

/// Highest clock value a remote stamp may carry. The upper half of the
/// range is reserved for local ticks.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

/// Clock errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("Lamport clock of {0} is exhausted")]
    Exhausted(ReplicaId),
    #[error("Stamp {clock} from {replica} exceeds the clock limit")]
    OutOfRange { clock: u64, replica: ReplicaId },
}

/// Lamport stamp of a single field write.
///
/// Field order matters: the derived `Ord` compares `clock` first and falls
/// back to `replica` as the deterministic tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(clock: u64, replica: ReplicaId) -> Self {
        Self { clock, replica }
    }
}

/// Per-field stamps of one block.
///
/// Replica-local bookkeeping that only the merge reads. Callers treat it as
/// an opaque blob that travels with the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtMeta {
    /// Stamp of the write that first created the block.
    pub created: Stamp,
    pub kind: Stamp,
    pub data: Stamp,
    pub index: Stamp,
    pub deleted: Stamp,
}

impl CrdtMeta {
    /// All fields written at once by the same write.
    pub fn uniform(stamp: Stamp) -> Self {
        Self {
            created: stamp.clone(),
            kind: stamp.clone(),
            data: stamp.clone(),
            index: stamp.clone(),
            deleted: stamp,
        }
    }

    /// The greatest stamp across all fields.
    pub fn latest(&self) -> &Stamp {
        [&self.kind, &self.data, &self.index, &self.deleted]
            .into_iter()
            .fold(&self.created, |acc, s| acc.max(s))
    }
}

/// Lamport clock owned by one replica.
///
/// Ticks on every local write and jumps forward when a remote stamp is
/// observed, so a local write made after seeing a remote one always wins
/// against it.
#[derive(Debug, Clone)]
pub struct LamportClock {
    replica: ReplicaId,
    time: u64,
}

impl LamportClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self { replica, time: 0 }
    }

    /// Resume from a previously observed time (after recovery).
    pub fn resume(replica: ReplicaId, time: u64) -> Self {
        Self { replica, time }
    }

    /// Advance and return a stamp for a new local write.
    pub fn tick(&mut self) -> Result<Stamp, ClockError> {
        self.time = self
            .time
            .checked_add(1)
            .ok_or_else(|| ClockError::Exhausted(self.replica.clone()))?;
        Ok(Stamp::new(self.time, self.replica.clone()))
    }

    /// Fold in a stamp seen from elsewhere. Stamps past [`MAX_CLOCK`] are
    /// refused and leave the clock unchanged.
    pub fn observe(&mut self, stamp: &Stamp) -> Result<(), ClockError> {
        if stamp.clock > MAX_CLOCK {
            return Err(ClockError::OutOfRange {
                clock: stamp.clock,
                replica: stamp.replica.clone(),
            });
        }
        self.time = self.time.max(stamp.clock);
        Ok(())
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}
