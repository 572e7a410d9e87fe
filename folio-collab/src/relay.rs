//! WebSocket relay: signaling and multi-hop forwarding between replicas.
//!
//! Architecture:
//! ```text
//! Replica A ──┐                        ┌──► Replica B
//!             ├── Room ── BroadcastGroup
//! Replica C ──┘   (name)               └──► Replica D
//! ```
//!
//! The relay holds no document state. It tells each joiner who is already in
//! the room, announces joins and departures, and fans `Forward` frames out to
//! the room. Every member drops frames it sent or that target someone else.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use folio_core::ReplicaId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Membership, RoomManager};
use crate::protocol::{MessageType, WireMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 16,
            broadcast_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub forwarded_frames: u64,
    pub rejected_joins: u64,
    pub active_rooms: usize,
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, connection, rooms, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        connection: u64,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_member(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            connection,
            &rooms,
            &stats,
            &config,
        )
        .await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }
        result
    }

    async fn serve_member(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        connection: u64,
        rooms: &RoomManager,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> ConnectionResult {
        // First message must be a hello naming the replica and the room.
        let hello = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match WireMessage::decode(&bytes) {
                        Ok(msg) if msg.msg_type == MessageType::Hello => break msg,
                        Ok(msg) => {
                            log::warn!("Expected hello from {addr}, got {:?}", msg.msg_type);
                        }
                        Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        };

        let peer = hello.sender.clone();
        let room = hello.room.clone();

        let Some(mut membership) = rooms
            .join(&room, peer.clone(), connection, config.max_peers_per_room)
            .await
        else {
            log::warn!("Room {room} is full, rejecting {peer}");
            stats.write().await.rejected_joins += 1;
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        };

        {
            let mut s = stats.write().await;
            s.active_rooms = rooms.room_count().await;
        }

        log::info!("Peer {peer} joined room {room} ({} others)", membership.roster.len());

        let outcome = Self::member_loop(
            ws_sender,
            ws_receiver,
            &peer,
            &room,
            &mut membership,
            stats,
        )
        .await;

        // Cleanup: a stale connection of a reconnected replica leaves silently.
        if membership.group.remove_member(&peer, connection).await {
            if let Err(e) = membership
                .group
                .broadcast(&WireMessage::peer_left(peer.clone(), room.clone()))
            {
                log::warn!("Failed to announce departure of {peer}: {e}");
            }
        }
        if rooms.leave(&room, &peer, connection).await {
            log::info!("Room {room} removed (empty)");
        }
        log::info!("Peer {peer} left room {room}");

        outcome
    }

    async fn member_loop(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        peer: &ReplicaId,
        room: &str,
        membership: &mut Membership,
        stats: &RwLock<RelayStats>,
    ) -> ConnectionResult {
        let roster = WireMessage::roster(room, &membership.roster)?;
        ws_sender.send(Message::Binary(roster.encode()?.into())).await?;
        membership
            .group
            .broadcast(&WireMessage::peer_joined(peer.clone(), room))?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let mut wire = match WireMessage::decode(&bytes) {
                                Ok(wire) => wire,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {peer}: {e}");
                                    continue;
                                }
                            };

                            match wire.msg_type {
                                MessageType::Forward => {
                                    // The relay vouches for the sender.
                                    wire.sender = peer.clone();
                                    wire.room = room.to_string();
                                    membership.group.broadcast(&wire)?;
                                    stats.write().await.forwarded_frames += 1;
                                }
                                MessageType::Ping => {
                                    let pong = WireMessage::pong(peer.clone());
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }
                                other => {
                                    log::debug!("Unhandled message type from {peer}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed by {peer}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {peer}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing room traffic
                msg = membership.receiver.recv() => {
                    match msg {
                        Ok(data) => {
                            match WireMessage::decode(&data) {
                                Ok(wire) if wire.is_for(peer) => {
                                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                }
                                _ => continue,
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer} lagged by {n} messages");
                            membership.group.record_dropped(n);
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
