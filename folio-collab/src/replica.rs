//! A complete replica: store, peer network and replication, wired together.

use std::sync::Arc;

use folio_core::{BlockView, ChangeEvent, ReplicaId};
use thiserror::Error;

use crate::edits::{commit_batch, BatchOutcome};
use crate::link::{LinkSync, Locator};
use crate::network::{ConnectionOptions, PeerError, PeerNetwork};
use crate::replicator::Replicator;
use crate::store::{BlockStore, StoreConfig, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// RocksDB settings; `None` keeps the store in memory
    pub storage: Option<StoreConfig>,
    /// Identity and transport
    pub connection: ConnectionOptions,
}

impl ReplicaConfig {
    pub fn new(connection: ConnectionOptions) -> Self {
        Self {
            storage: None,
            connection,
        }
    }

    pub fn with_storage(mut self, storage: StoreConfig) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.connection.replica
    }
}

pub struct Replica {
    store: Arc<BlockStore>,
    replicator: Replicator,
}

impl Replica {
    /// Open the store, start the network and begin replicating.
    pub async fn start(config: ReplicaConfig) -> Result<Self, ReplicaError> {
        let replica = config.replica().clone();
        let store = match config.storage {
            Some(storage) => BlockStore::open_rocks(replica.clone(), storage)?,
            None => BlockStore::in_memory(replica.clone()),
        };
        let store = Arc::new(store);

        let (network, channels) = PeerNetwork::open(config.connection).await?;
        let replicator = Replicator::start(store.clone(), network, channels);

        log::info!("Replica {replica} started ({} blocks)", store.len());
        Ok(Self { store, replicator })
    }

    pub fn id(&self) -> &ReplicaId {
        self.store.replica()
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn network(&self) -> &PeerNetwork {
        self.replicator.network()
    }

    /// Apply a batch of editing-surface events.
    pub fn commit<I>(&self, events: I) -> Result<BatchOutcome, StoreError>
    where
        I: IntoIterator<Item = ChangeEvent>,
    {
        commit_batch(&self.store, events)
    }

    /// Ordered live blocks, as the editing surface persists them.
    pub fn save(&self) -> Vec<BlockView> {
        self.store.save()
    }

    pub fn link<L: Locator>(&self, locator: L) -> LinkSync<L> {
        LinkSync::new(self.store.clone(), locator)
    }

    /// Stop replication and tear the network down. Idempotent.
    pub async fn shutdown(&self) {
        self.replicator.shutdown().await;
        log::info!("Replica {} stopped", self.id());
    }
}
