//! # folio-collab: Replication layer for Folio
//!
//! Keeps a replica's blocks durable and in sync with its peers.
//!
//! ## Architecture
//!
//! ```text
//!  edit events ──► edits::commit_batch ──► BlockStore ──► (memory | RocksDB)
//!                                             │  ▲
//!                               notifications │  │ merge_remote
//!                                             ▼  │
//!                                          Replicator ◄──► LinkSync ◄──► Locator
//!                                             │  ▲
//!                                             ▼  │
//!                                          PeerNetwork
//!                             ┌───────────────┼───────────────┐
//!                          Memory        Relay (WS)       Direct (WS)
//!                                            │
//!                                       RelayServer
//!                                     (rooms, fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`store`] - Block store with memory and RocksDB backends
//! - [`protocol`] - Binary wire protocol (bincode-encoded WireMessage, PeerFrame)
//! - [`broadcast`] - Room-based fan-out for the relay
//! - [`relay`] - WebSocket relay server
//! - [`network`] - Peer connection layer and its transports
//! - [`replicator`] - Store ↔ peers replication
//! - [`link`] - Shareable-link snapshots
//! - [`edits`] - Reduced edit batches into store writes
//! - [`replica`] - One-call replica bootstrap

pub mod broadcast;
pub mod edits;
pub mod link;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod replicator;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use edits::{commit_batch, BatchOutcome};
pub use link::{FileLocator, LinkSync, Locator, LocatorError, MemoryLocator};
pub use network::{
    Backoff, ConnectionOptions, MemoryHub, PeerChannels, PeerError, PeerMessage, PeerNetwork,
    PeerState, TransportKind,
};
pub use protocol::{FrameBody, MessageType, PeerFrame, ProtocolError, WireMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use replica::{Replica, ReplicaConfig, ReplicaError};
pub use replicator::{ReplicationMessage, Replicator};
pub use store::{
    BlockBackend, BlockChange, BlockStore, MemoryBackend, RocksBackend, StoreConfig, StoreError,
};
