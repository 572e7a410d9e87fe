//! Fan-out broadcast to the members of a relay room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! messages; filtering by sender and target happens on the receiving side.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use folio_core::ReplicaId;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single room.
///
/// A member is identified by its replica id plus the connection that joined,
/// so a stale connection leaving never evicts a fresh one with the same id.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// replica id → connection id
    members: RwLock<HashMap<ReplicaId, u64>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many messages can be buffered per member
    /// before lagging members start dropping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a member, replacing any older connection of the same replica.
    ///
    /// Returns a receiver for this member to consume messages.
    pub async fn add_member(
        &self,
        peer: ReplicaId,
        connection: u64,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.insert(peer, connection);
        self.sender.subscribe()
    }

    /// Remove a member if `connection` is still the one registered for it.
    pub async fn remove_member(&self, peer: &ReplicaId, connection: u64) -> bool {
        let mut members = self.members.write().await;
        if members.get(peer) == Some(&connection) {
            members.remove(peer);
            true
        } else {
            false
        }
    }

    /// Broadcast a message to every subscriber.
    ///
    /// Returns the number of receivers that got the message.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Member ids, sorted.
    pub async fn members(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.members.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_member(&self, peer: &ReplicaId) -> bool {
        self.members.read().await.contains_key(peer)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Result of joining a room.
pub struct Membership {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    /// Members present before the join
    pub roster: Vec<ReplicaId>,
}

/// Room manager: maps room names to broadcast groups.
///
/// Joins and leaves run under the manager's write lock, so a room is never
/// dropped between a joiner looking it up and registering in it.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join `room`, creating it on first use.
    ///
    /// Returns `None` when the room already holds `max_members` other members.
    pub async fn join(
        &self,
        room: &str,
        peer: ReplicaId,
        connection: u64,
        max_members: usize,
    ) -> Option<Membership> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();

        let roster: Vec<ReplicaId> = group
            .members()
            .await
            .into_iter()
            .filter(|m| m != &peer)
            .collect();
        if roster.len() >= max_members {
            if group.member_count().await == 0 {
                rooms.remove(room);
            }
            return None;
        }

        let receiver = group.add_member(peer, connection).await;
        Some(Membership {
            group,
            receiver,
            roster,
        })
    }

    /// Leave `room`. Returns `true` when this emptied and removed the room.
    pub async fn leave(&self, room: &str, peer: &ReplicaId, connection: u64) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room).cloned() else {
            return false;
        };
        group.remove_member(peer, connection).await;
        if group.member_count().await == 0 {
            rooms.remove(room);
            return true;
        }
        false
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
