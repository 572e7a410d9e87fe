//! Replication between a block store and its peers.
//!
//! ```text
//!  store notifications ──(writer == local)──► broadcast Upsert
//!  notifications lagged ──► broadcast Upsert for every block
//!  connect(peer) ──► StateRequest ──► peer answers State(export_all)
//!  message / response ──► merge_remote(block, peer)   (no echo: writer = peer)
//! ```
//!
//! Remote merges are tagged with the delivering peer, so their notifications
//! never go back out. A merge that changes nothing is silent in the store,
//! which is what stops two replicas from bouncing the same block forever.

use std::sync::Arc;

use folio_core::{Block, ReplicaId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::network::{PeerChannels, PeerMessage, PeerNetwork};
use crate::protocol::ProtocolError;
use crate::store::{BlockChange, BlockStore, StoreError};

/// Replication payload carried inside peer frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// One block's full state
    Upsert(Block),
    /// Ask for the peer's full state
    StateRequest,
    /// Every block the sender holds, tombstones included
    State(Vec<Block>),
}

impl ReplicationMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Keeps one store in sync with every peer of one network.
pub struct Replicator {
    store: Arc<BlockStore>,
    network: Arc<PeerNetwork>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    /// Subscribe to the store and start the replication loop.
    pub fn start(store: Arc<BlockStore>, network: PeerNetwork, channels: PeerChannels) -> Self {
        let network = Arc::new(network);
        let (stop, stop_rx) = watch::channel(false);

        let worker = Worker {
            local: store.replica().clone(),
            store: store.clone(),
            network: network.clone(),
            inserts: store.subscribe_inserts(),
            updates: store.subscribe_updates(),
            removals: store.subscribe_removals(),
        };
        let task = tokio::spawn(worker.run(channels, stop_rx));

        Self {
            store,
            network,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn network(&self) -> &PeerNetwork {
        &self.network
    }

    /// Stop replicating, then destroy the network. Idempotent.
    pub async fn shutdown(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = self.stop.send(true);
            if let Err(e) = task.await {
                log::error!("Replication task failed: {e}");
            }
        }
        self.network.destroy().await;
    }
}

struct Worker {
    local: ReplicaId,
    store: Arc<BlockStore>,
    network: Arc<PeerNetwork>,
    inserts: broadcast::Receiver<BlockChange>,
    updates: broadcast::Receiver<BlockChange>,
    removals: broadcast::Receiver<BlockChange>,
}

impl Worker {
    async fn run(mut self, mut channels: PeerChannels, mut stop: watch::Receiver<bool>) {
        log::debug!("Replication for {} started", self.local);
        loop {
            tokio::select! {
                _ = stop.changed() => break,

                change = self.inserts.recv() => self.on_local_change(change),
                change = self.updates.recv() => self.on_local_change(change),
                change = self.removals.recv() => self.on_local_change(change),

                peer = channels.connect.recv() => {
                    let Some(peer) = peer else { break };
                    self.request_state(&peer);
                }
                peer = channels.disconnect.recv() => {
                    let Some(peer) = peer else { break };
                    log::debug!("{} lost peer {peer}", self.local);
                }
                msg = channels.message.recv() => {
                    let Some(msg) = msg else { break };
                    self.on_message(msg);
                }
                msg = channels.response.recv() => {
                    let Some(msg) = msg else { break };
                    self.on_response(msg);
                }
                error = channels.error.recv() => {
                    let Some(error) = error else { break };
                    // Transport errors never stop replication with other peers.
                    log::warn!("{}: peer error: {error}", self.local);
                }
            }
        }
        log::debug!("Replication for {} stopped", self.local);
    }

    fn on_local_change(&self, change: Result<BlockChange, RecvError>) {
        match change {
            Ok(change) if change.writer == self.local => self.broadcast_block(change.block),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                // The missed notifications may include imports, whose blocks
                // keep their original author, so send everything.
                log::warn!("Replication lagged by {n} notifications, rebroadcasting all blocks");
                for block in self.store.export_all() {
                    self.broadcast_block(block);
                }
            }
            Err(RecvError::Closed) => {}
        }
    }

    fn broadcast_block(&self, block: Block) {
        let id = block.id.clone();
        match ReplicationMessage::Upsert(block).encode() {
            Ok(payload) => {
                let peers = self.network.broadcast(&payload);
                log::trace!("Sent {id} to {peers} peers");
            }
            Err(e) => log::error!("Failed to encode {id}: {e}"),
        }
    }

    fn request_state(&self, peer: &ReplicaId) {
        let request = match ReplicationMessage::StateRequest.encode() {
            Ok(request) => request,
            Err(e) => {
                log::error!("Failed to encode state request: {e}");
                return;
            }
        };
        if let Err(e) = self.network.request(peer, request) {
            log::warn!("State request to {peer} failed: {e}");
        }
    }

    fn on_message(&self, msg: PeerMessage) {
        let decoded = match ReplicationMessage::decode(&msg.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping malformed message from {}: {e}", msg.peer);
                return;
            }
        };
        match decoded {
            ReplicationMessage::Upsert(block) => {
                if block.last_edited_by == self.local {
                    log::trace!("Ignoring echo of {}", block.id);
                    return;
                }
                self.merge(block, &msg.peer);
            }
            ReplicationMessage::StateRequest => self.answer_state(&msg),
            ReplicationMessage::State(blocks) => self.merge_all(blocks, &msg.peer),
        }
    }

    fn on_response(&self, msg: PeerMessage) {
        match ReplicationMessage::decode(&msg.payload) {
            Ok(ReplicationMessage::State(blocks)) => {
                log::debug!("{} received {} blocks from {}", self.local, blocks.len(), msg.peer);
                self.merge_all(blocks, &msg.peer);
            }
            Ok(other) => log::warn!("Unexpected response from {}: {other:?}", msg.peer),
            Err(e) => log::warn!("Dropping malformed response from {}: {e}", msg.peer),
        }
    }

    fn answer_state(&self, msg: &PeerMessage) {
        let Some(correlation) = msg.correlation else {
            log::warn!("State request from {} without correlation", msg.peer);
            return;
        };
        let state = match ReplicationMessage::State(self.store.export_all()).encode() {
            Ok(state) => state,
            Err(e) => {
                log::error!("Failed to encode state: {e}");
                return;
            }
        };
        if let Err(e) = self.network.respond(&msg.peer, correlation, state) {
            log::warn!("State response to {} failed: {e}", msg.peer);
        }
    }

    fn merge(&self, block: Block, peer: &ReplicaId) {
        let id = block.id.clone();
        match self.store.merge_remote(block, peer) {
            Ok(_) => {}
            // Already logged by the store; the peer's other blocks still merge.
            Err(StoreError::Clock(_)) => {}
            Err(e) => log::error!("Failed to merge {id} from {peer}: {e}"),
        }
    }

    fn merge_all(&self, blocks: Vec<Block>, peer: &ReplicaId) {
        for block in blocks {
            self.merge(block, peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionOptions, MemoryHub, TransportKind};
    use folio_core::{BlockPatch, Stamp};

    async fn open(hub: &MemoryHub, name: &str) -> (PeerNetwork, PeerChannels) {
        let options = ConnectionOptions::for_testing(
            ReplicaId::from(name),
            TransportKind::Memory(hub.clone()),
        );
        PeerNetwork::open(options).await.unwrap()
    }

    #[tokio::test]
    async fn test_lag_rebroadcasts_imported_blocks() {
        let hub = MemoryHub::new();
        let store = Arc::new(BlockStore::in_memory(ReplicaId::from("a")));
        let imported = Block::create(
            &BlockPatch::new("imported"),
            Stamp::new(4, ReplicaId::from("author")),
        );
        store.import_all(vec![imported.clone()]).unwrap();

        let (network, mut events) = open(&hub, "a").await;
        let (peer, mut peer_events) = open(&hub, "b").await;
        peer.connect("a");
        assert_eq!(events.connect.recv().await, Some(ReplicaId::from("b")));
        assert_eq!(peer_events.connect.recv().await, Some(ReplicaId::from("a")));

        let worker = Worker {
            local: ReplicaId::from("a"),
            store: store.clone(),
            network: Arc::new(network),
            inserts: store.subscribe_inserts(),
            updates: store.subscribe_updates(),
            removals: store.subscribe_removals(),
        };
        worker.on_local_change(Err(RecvError::Lagged(1)));

        let msg = peer_events.message.recv().await.unwrap();
        assert_eq!(msg.peer, ReplicaId::from("a"));
        assert_eq!(
            ReplicationMessage::decode(&msg.payload).unwrap(),
            ReplicationMessage::Upsert(imported)
        );

        worker.network.destroy().await;
        peer.destroy().await;
    }

    #[test]
    fn test_message_roundtrip() {
        let block = Block::create(&BlockPatch::new("b"), Stamp::new(3, ReplicaId::from("r")));
        for msg in [
            ReplicationMessage::Upsert(block.clone()),
            ReplicationMessage::StateRequest,
            ReplicationMessage::State(vec![block]),
        ] {
            assert_eq!(ReplicationMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ReplicationMessage::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
