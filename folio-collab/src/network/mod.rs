//! Peer connection layer.
//!
//! One [`PeerNetwork`] per replica. Whatever the transport, the application
//! sees the same five event channels and the same `send`/`request`/`respond`
//! surface:
//!
//! ```text
//!                 ┌──────────────── PeerNetwork ────────────────┐
//!  send/request ─►│ PeerTable (state + link per peer)           │
//!                 │     ▲                     │                 │
//!                 │     │ deliver             ▼ outbound        │
//!                 │  ┌──┴─────────────────────────────┐         │
//!                 │  │ Memory │ Relay (WS) │ Direct (WS)│         │
//!                 │  └────────────────────────────────┘         │
//!                 └──► connect │ disconnect │ message │ response │ error
//! ```
//!
//! Per-peer lifecycle: `Discovered → Connecting → Open → Closed`, with
//! `Errored` reachable from any state. A closed peer is dropped from the
//! table, so a later reconnection is a fresh peer.

mod direct;
mod memory;
mod peers;
mod relay;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use folio_core::ReplicaId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::protocol::{PeerFrame, ProtocolError};

pub use memory::MemoryHub;

use direct::DirectTransport;
use peers::PeerTable;

/// Lifecycle state of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Discovered,
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Errors surfaced by the peer layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Relay connection dropped; the transport reconnects on its own
    #[error("Signaling connection lost: {0}")]
    SignalingLost(String),
    #[error("Transport error with {peer}: {reason}")]
    Transport { peer: ReplicaId, reason: String },
    #[error("Could not reach {target}: {reason}")]
    Unreachable { target: String, reason: String },
    /// A peer sent something undecodable; the link stays up
    #[error("Malformed message from {peer}: {reason}")]
    Malformed { peer: ReplicaId, reason: String },
    #[error("Peer {0} is not connected")]
    NotConnected(ReplicaId),
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("Peer network destroyed")]
    Destroyed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl PeerError {
    /// Whether the network keeps working after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PeerError::Destroyed | PeerError::Bind { .. })
    }
}

/// Payload received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub peer: ReplicaId,
    /// Set on requests and on responses
    pub correlation: Option<u64>,
    pub payload: Vec<u8>,
}

/// The five event channels of a [`PeerNetwork`].
///
/// All of them close once the network is destroyed.
pub struct PeerChannels {
    pub connect: mpsc::UnboundedReceiver<ReplicaId>,
    pub disconnect: mpsc::UnboundedReceiver<ReplicaId>,
    pub message: mpsc::UnboundedReceiver<PeerMessage>,
    pub response: mpsc::UnboundedReceiver<PeerMessage>,
    pub error: mpsc::UnboundedReceiver<PeerError>,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            factor: 2,
        }
    }
}

impl Backoff {
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(200),
            factor: 2,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

/// How a network reaches its peers.
#[derive(Debug, Clone)]
pub enum TransportKind {
    /// In-process switchboard (tabs, tests)
    Memory(MemoryHub),
    /// Through a relay server room
    Relay { url: String, room: String },
    /// Peer-to-peer WebSocket links
    Direct {
        listen: Option<String>,
        dial: Vec<String>,
    },
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Identity announced to peers
    pub replica: ReplicaId,
    pub transport: TransportKind,
    pub backoff: Backoff,
    /// Interval between relay heartbeats
    pub heartbeat: Duration,
    /// Time allowed for the hello exchange on a direct link
    pub handshake_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(replica: ReplicaId, transport: TransportKind) -> Self {
        Self {
            replica,
            transport,
            backoff: Backoff::default(),
            heartbeat: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Short delays and timeouts.
    pub fn for_testing(replica: ReplicaId, transport: TransportKind) -> Self {
        Self {
            replica,
            transport,
            backoff: Backoff::for_testing(),
            heartbeat: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

/// Background tasks owned by one network.
///
/// Shutting down aborts and awaits every task; spawning afterwards is a no-op.
pub(crate) struct TaskSet {
    closed: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Reap finished tasks.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub(crate) async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *guard)
        };
        tasks.shutdown().await;
    }
}

enum Transport {
    Memory(MemoryHub),
    Relay,
    Direct(Arc<DirectTransport>),
}

/// A replica's connections to its peers.
pub struct PeerNetwork {
    table: Arc<PeerTable>,
    tasks: Arc<TaskSet>,
    transport: Transport,
    next_correlation: AtomicU64,
    destroyed: AtomicBool,
}

impl PeerNetwork {
    /// Start the transport described by `options`.
    ///
    /// Only binding a direct listener can fail here; everything else is
    /// reported on the error channel as it happens.
    pub async fn open(options: ConnectionOptions) -> Result<(Self, PeerChannels), PeerError> {
        let (table, channels) = PeerTable::new(options.replica.clone());
        let tasks = Arc::new(TaskSet::new());

        let transport = match &options.transport {
            TransportKind::Memory(hub) => {
                hub.register(&table);
                Transport::Memory(hub.clone())
            }
            TransportKind::Relay { url, room } => {
                relay::start(url.clone(), room.clone(), &options, table.clone(), &tasks);
                Transport::Relay
            }
            TransportKind::Direct { listen, dial } => {
                let direct =
                    DirectTransport::start(listen.clone(), &options, table.clone(), tasks.clone())
                        .await?;
                for addr in dial {
                    direct.dial(addr.clone());
                }
                Transport::Direct(direct)
            }
        };

        log::info!("Peer network for {} opened", options.replica);
        Ok((
            Self {
                table,
                tasks,
                transport,
                next_correlation: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            },
            channels,
        ))
    }

    pub fn replica(&self) -> &ReplicaId {
        self.table.local()
    }

    /// Ask the transport to reach `target`.
    ///
    /// Memory networks take a replica id, direct networks an address. Relayed
    /// peers are brokered by the relay, so the target is only recorded as
    /// discovered. Completion is reported on the `connect` or `error` channel,
    /// never synchronously. Dialing an open peer is a no-op.
    pub fn connect(&self, target: impl Into<String>) {
        let target = target.into();
        if self.destroyed.load(Ordering::SeqCst) {
            log::debug!("Ignoring connect to {target} on a destroyed network");
            return;
        }
        match &self.transport {
            Transport::Memory(hub) => {
                let hub = hub.clone();
                let table = self.table.clone();
                self.tasks.spawn(async move {
                    tokio::task::yield_now().await;
                    hub.dial(&table, &ReplicaId::from(target));
                });
            }
            Transport::Relay => self.table.discover(&ReplicaId::from(target)),
            Transport::Direct(direct) => direct.dial(target),
        }
    }

    /// Send an unsolicited message.
    pub fn send(&self, peer: &ReplicaId, payload: Vec<u8>) -> Result<(), PeerError> {
        self.check()?;
        self.table
            .send(peer, PeerFrame::message(self.replica().clone(), payload))
    }

    /// Send to every open peer. Returns how many peers it was queued for.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        if self.check().is_err() {
            return 0;
        }
        let mut sent = 0;
        for peer in self.table.open_peers() {
            match self.send(&peer, payload.to_vec()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast to {peer} failed: {e}"),
            }
        }
        sent
    }

    /// Send a request. The reply arrives on the `response` channel with the
    /// returned correlation.
    pub fn request(&self, peer: &ReplicaId, payload: Vec<u8>) -> Result<u64, PeerError> {
        self.check()?;
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        self.table.send(
            peer,
            PeerFrame::request(self.replica().clone(), correlation, payload),
        )?;
        Ok(correlation)
    }

    /// Answer a request received on the `message` channel.
    pub fn respond(
        &self,
        peer: &ReplicaId,
        correlation: u64,
        payload: Vec<u8>,
    ) -> Result<(), PeerError> {
        self.check()?;
        self.table.send(
            peer,
            PeerFrame::response(self.replica().clone(), correlation, payload),
        )
    }

    /// Currently open peers, sorted.
    pub fn open_peers(&self) -> Vec<ReplicaId> {
        self.table.open_peers()
    }

    /// `None` for peers the table does not know (never seen, or closed).
    pub fn peer_state(&self, peer: &ReplicaId) -> Option<PeerState> {
        self.table.state(peer)
    }

    /// Local listen address of a direct network.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.transport {
            Transport::Direct(direct) => direct.local_addr(),
            _ => None,
        }
    }

    /// Tear down every transport and close the five channels.
    ///
    /// Idempotent; returns once the transport tasks are gone.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Transport::Memory(hub) = &self.transport {
            hub.unregister(self.table.local());
        }
        self.tasks.shutdown().await;
        self.table.shutdown();
        log::info!("Peer network for {} destroyed", self.table.local());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PeerError> {
        if self.is_destroyed() {
            return Err(PeerError::Destroyed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_error_recoverability() {
        assert!(PeerError::SignalingLost("x".into()).is_recoverable());
        assert!(PeerError::Malformed {
            peer: ReplicaId::from("a"),
            reason: "bad".into()
        }
        .is_recoverable());
        assert!(!PeerError::Destroyed.is_recoverable());
    }

    #[tokio::test]
    async fn test_task_set_shutdown() {
        let tasks = TaskSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tasks.spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        tasks.shutdown().await;
        // The aborted task dropped its sender.
        assert!(rx.recv().await.is_none());

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tasks.spawn(async move {
            let _ = tx.send(());
        });
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_closes_channels() {
        let hub = MemoryHub::new();
        let (network, mut channels) = PeerNetwork::open(ConnectionOptions::for_testing(
            ReplicaId::from("a"),
            TransportKind::Memory(hub.clone()),
        ))
        .await
        .unwrap();

        network.destroy().await;
        network.destroy().await;

        assert!(channels.connect.recv().await.is_none());
        assert!(channels.disconnect.recv().await.is_none());
        assert!(channels.message.recv().await.is_none());
        assert!(channels.response.recv().await.is_none());
        assert!(channels.error.recv().await.is_none());
        assert!(hub.members().is_empty());
        assert_eq!(
            network.send(&ReplicaId::from("b"), vec![]),
            Err(PeerError::Destroyed)
        );
    }
}
