//! # folio-core: Block document model for Folio
//!
//! Pure, I/O-free building blocks shared by every replica:
//!
//! ```text
//! edit events ──► reducer ──► BlockPatch ──► Block (+ CrdtMeta stamps)
//!                                              │
//!                             merge ◄──────────┤ (remote copies)
//!                                              ▼
//!                                   codec ──► shareable string
//! ```
//!
//! ## Modules
//!
//! - [`block`] - Block, patches, views and the convergent merge
//! - [`crdt`] - Lamport stamps and per-field merge metadata
//! - [`reducer`] - Collapses bursts of edit events per block
//! - [`codec`] - Compressed, URL-safe document snapshots

pub mod block;
pub mod codec;
pub mod crdt;
pub mod reducer;

// Re-exports for convenience
pub use block::{Block, BlockId, BlockPatch, BlockView, Payload, ReplicaId, DEFAULT_BLOCK_KIND};
pub use codec::{DocumentSnapshot, SnapshotError, SNAPSHOT_VERSION};
pub use crdt::{ClockError, CrdtMeta, LamportClock, Stamp, MAX_CLOCK};
pub use reducer::{reduce, ChangeEvent, EditKind};
