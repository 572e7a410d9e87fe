//! Peer table shared by every transport.
//!
//! Holds the lifecycle state and the live link of each peer, and owns the
//! only senders of the five event channels, so dropping them on shutdown
//! closes the channels no matter which transport tasks are still around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use folio_core::ReplicaId;
use tokio::sync::mpsc;

use super::{PeerChannels, PeerError, PeerMessage, PeerState};
use crate::protocol::PeerFrame;

/// A frame queued for one peer.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub to: ReplicaId,
    pub frame: PeerFrame,
}

pub(crate) type LinkSender = mpsc::UnboundedSender<Outbound>;

struct Link {
    id: u64,
    sender: LinkSender,
}

struct PeerEntry {
    state: PeerState,
    link: Option<Link>,
}

impl PeerEntry {
    fn with_state(state: PeerState) -> Self {
        Self { state, link: None }
    }
}

struct Sinks {
    connect: mpsc::UnboundedSender<ReplicaId>,
    disconnect: mpsc::UnboundedSender<ReplicaId>,
    message: mpsc::UnboundedSender<PeerMessage>,
    response: mpsc::UnboundedSender<PeerMessage>,
    error: mpsc::UnboundedSender<PeerError>,
}

pub(crate) struct PeerTable {
    local: ReplicaId,
    peers: Mutex<HashMap<ReplicaId, PeerEntry>>,
    sinks: Mutex<Option<Sinks>>,
    next_link: AtomicU64,
}

impl PeerTable {
    pub(crate) fn new(local: ReplicaId) -> (Arc<Self>, PeerChannels) {
        let (connect_tx, connect) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect) = mpsc::unbounded_channel();
        let (message_tx, message) = mpsc::unbounded_channel();
        let (response_tx, response) = mpsc::unbounded_channel();
        let (error_tx, error) = mpsc::unbounded_channel();

        let table = Arc::new(Self {
            local,
            peers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Some(Sinks {
                connect: connect_tx,
                disconnect: disconnect_tx,
                message: message_tx,
                response: response_tx,
                error: error_tx,
            })),
            next_link: AtomicU64::new(1),
        });
        let channels = PeerChannels {
            connect,
            disconnect,
            message,
            response,
            error,
        };
        (table, channels)
    }

    pub(crate) fn local(&self) -> &ReplicaId {
        &self.local
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ReplicaId, PeerEntry>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, f: impl FnOnce(&Sinks)) {
        if let Some(sinks) = self.sinks.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            f(sinks);
        }
    }

    fn emit_connect(&self, peer: &ReplicaId) {
        log::info!("{} connected to {peer}", self.local);
        self.emit(|s| {
            let _ = s.connect.send(peer.clone());
        });
    }

    fn emit_disconnect(&self, peer: &ReplicaId) {
        log::info!("{} disconnected from {peer}", self.local);
        self.emit(|s| {
            let _ = s.disconnect.send(peer.clone());
        });
    }

    /// Record a peer we learned about without a link yet.
    pub(crate) fn discover(&self, peer: &ReplicaId) {
        if peer == &self.local {
            return;
        }
        self.peers()
            .entry(peer.clone())
            .or_insert_with(|| PeerEntry::with_state(PeerState::Discovered));
    }

    /// Mark a dial as started. `false` when the peer is already open or
    /// being dialed.
    pub(crate) fn begin_dial(&self, peer: &ReplicaId) -> bool {
        let mut peers = self.peers();
        let entry = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerEntry::with_state(PeerState::Discovered));
        if matches!(entry.state, PeerState::Open | PeerState::Connecting) {
            return false;
        }
        entry.state = PeerState::Connecting;
        true
    }

    /// Forget a dial that produced no link.
    pub(crate) fn abandon_dial(&self, peer: &ReplicaId) {
        let mut peers = self.peers();
        if peers.get(peer).is_some_and(|e| e.state == PeerState::Connecting) {
            peers.remove(peer);
        }
    }

    /// Attach a link to `peer`. Returns `false`, leaving the table unchanged,
    /// when the peer already has a link.
    pub(crate) fn open(&self, peer: ReplicaId, link: u64, sender: LinkSender) -> bool {
        if peer == self.local {
            return false;
        }
        let mut peers = self.peers();
        let entry = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerEntry::with_state(PeerState::Discovered));
        if entry.link.is_some() {
            return false;
        }
        entry.state = PeerState::Open;
        entry.link = Some(Link { id: link, sender });
        drop(peers);
        self.emit_connect(&peer);
        true
    }

    /// Attach a link to `peer`, superseding any existing one. The peer is
    /// only announced if it was not open before.
    pub(crate) fn replace(&self, peer: ReplicaId, link: u64, sender: LinkSender) -> bool {
        if peer == self.local {
            return false;
        }
        let mut peers = self.peers();
        let entry = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerEntry::with_state(PeerState::Discovered));
        let was_open = entry.link.is_some();
        entry.state = PeerState::Open;
        entry.link = Some(Link { id: link, sender });
        drop(peers);
        if !was_open {
            self.emit_connect(&peer);
        }
        true
    }

    /// Close `peer` if `link` is still its live link.
    pub(crate) fn close(&self, peer: &ReplicaId, link: u64) -> bool {
        let mut peers = self.peers();
        let current = peers
            .get(peer)
            .and_then(|e| e.link.as_ref())
            .map(|l| l.id);
        if current != Some(link) {
            return false;
        }
        peers.remove(peer);
        drop(peers);
        self.emit_disconnect(peer);
        true
    }

    /// Close every peer carried by `link`. Returns the closed peers.
    pub(crate) fn close_link(&self, link: u64) -> Vec<ReplicaId> {
        let mut peers = self.peers();
        let closed: Vec<ReplicaId> = peers
            .iter()
            .filter(|(_, e)| e.link.as_ref().is_some_and(|l| l.id == link))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &closed {
            peers.remove(id);
        }
        drop(peers);
        for id in &closed {
            self.emit_disconnect(id);
        }
        closed
    }

    /// Close `peer` whatever link it is on.
    pub(crate) fn close_peer(&self, peer: &ReplicaId) -> bool {
        let removed = self.peers().remove(peer);
        match removed {
            Some(entry) if entry.link.is_some() => {
                self.emit_disconnect(peer);
                true
            }
            _ => false,
        }
    }

    /// A peer that never opened failed; it stays visible as `Errored`.
    pub(crate) fn fail(&self, peer: &ReplicaId, error: PeerError) {
        {
            let mut peers = self.peers();
            if let Some(entry) = peers.get_mut(peer) {
                if entry.link.is_none() {
                    entry.state = PeerState::Errored;
                }
            }
        }
        self.report(error);
    }

    /// Surface an error on the error channel.
    pub(crate) fn report(&self, error: PeerError) {
        log::warn!("{}: {error}", self.local);
        self.emit(|s| {
            let _ = s.error.send(error);
        });
    }

    /// Route an inbound frame to the message or the response channel.
    pub(crate) fn deliver(&self, from: &ReplicaId, frame: PeerFrame) {
        if &frame.sender != from {
            log::debug!("Frame from {from} claims sender {}", frame.sender);
        }
        let is_response = frame.is_response();
        let message = PeerMessage {
            peer: from.clone(),
            correlation: frame.correlation,
            payload: frame.into_payload(),
        };
        self.emit(|s| {
            let _ = if is_response {
                s.response.send(message)
            } else {
                s.message.send(message)
            };
        });
    }

    /// Queue a frame on the peer's live link.
    pub(crate) fn send(&self, peer: &ReplicaId, frame: PeerFrame) -> Result<(), PeerError> {
        let peers = self.peers();
        let link = peers
            .get(peer)
            .and_then(|e| e.link.as_ref())
            .ok_or_else(|| PeerError::NotConnected(peer.clone()))?;
        link.sender
            .send(Outbound {
                to: peer.clone(),
                frame,
            })
            .map_err(|_| PeerError::Transport {
                peer: peer.clone(),
                reason: "link closed".into(),
            })
    }

    pub(crate) fn open_peers(&self) -> Vec<ReplicaId> {
        let mut open: Vec<ReplicaId> = self
            .peers()
            .iter()
            .filter(|(_, e)| e.state == PeerState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        open
    }

    pub(crate) fn state(&self, peer: &ReplicaId) -> Option<PeerState> {
        self.peers().get(peer).map(|e| e.state)
    }

    /// Close every peer and the event channels.
    pub(crate) fn shutdown(&self) {
        let open: Vec<ReplicaId> = {
            let mut peers = self.peers();
            let open = peers
                .iter()
                .filter(|(_, e)| e.link.is_some())
                .map(|(id, _)| id.clone())
                .collect();
            peers.clear();
            open
        };
        for peer in &open {
            self.emit_disconnect(peer);
        }
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
