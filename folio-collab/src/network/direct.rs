//! Direct peer-to-peer WebSocket links.
//!
//! Each side sends a `Hello` carrying its replica id, then both exchange raw
//! [`PeerFrame`]s. When two links to the same peer exist (both sides dialed
//! at once), the link dialed by the smaller replica id is kept on both ends.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use folio_core::ReplicaId;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::peers::{Outbound, PeerTable};
use super::{Backoff, ConnectionOptions, PeerError, PeerState, TaskSet};
use crate::protocol::{MessageType, PeerFrame, ProtocolError, WireMessage};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

pub(crate) struct DirectTransport {
    table: Arc<PeerTable>,
    tasks: Arc<TaskSet>,
    backoff: Backoff,
    handshake_timeout: Duration,
    dialing: Mutex<HashSet<String>>,
    local_addr: Option<SocketAddr>,
}

impl DirectTransport {
    /// Bind the listener (if any) and start accepting.
    pub(crate) async fn start(
        listen: Option<String>,
        options: &ConnectionOptions,
        table: Arc<PeerTable>,
        tasks: Arc<TaskSet>,
    ) -> Result<Arc<Self>, PeerError> {
        let listener = match listen {
            Some(addr) => Some(TcpListener::bind(&addr).await.map_err(|e| PeerError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let transport = Arc::new(Self {
            table,
            tasks,
            backoff: options.backoff.clone(),
            handshake_timeout: options.handshake_timeout,
            dialing: Mutex::new(HashSet::new()),
            local_addr,
        });

        if let Some(listener) = listener {
            if let Some(addr) = local_addr {
                log::info!("{} accepting direct links on {addr}", transport.table.local());
            }
            let accepting = transport.clone();
            transport
                .tasks
                .spawn(async move { accepting.accept_loop(listener).await });
        }
        Ok(transport)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Keep a link to `addr` up. Dialing an address twice is a no-op.
    pub(crate) fn dial(self: &Arc<Self>, addr: String) {
        let fresh = self
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.clone());
        if !fresh {
            log::debug!("Already dialing {addr}");
            return;
        }
        let dialer = self.clone();
        self.tasks.spawn(async move { dialer.dial_loop(addr).await });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(self.backoff.initial).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let transport = self.clone();
            self.tasks.spawn(async move {
                if let Err(e) = transport.accept_link(stream).await {
                    log::warn!("Link from {addr} failed: {e}");
                    transport.table.report(e);
                }
            });
        }
    }

    async fn accept_link(&self, stream: TcpStream) -> Result<(), PeerError> {
        let peer_addr = stream
            .peer_addr()
            .map_or_else(|_| "incoming link".to_string(), |a| a.to_string());
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| PeerError::Unreachable {
                target: peer_addr,
                reason: e.to_string(),
            })?;
        let (mut sink, mut source) = ws.split();

        let peer = self.read_hello(&mut source).await?;
        self.send_hello(&mut sink, &peer).await?;
        self.run_link(peer, sink, source, false).await
    }

    async fn dial_loop(&self, addr: String) {
        let mut attempt: u32 = 0;
        loop {
            match self.dial_once(&addr).await {
                Ok((peer, _, _)) if &peer == self.table.local() => {
                    log::warn!("{addr} is this replica; not dialing it again");
                    return;
                }
                Ok((peer, sink, source)) => {
                    attempt = 0;
                    if let Err(e) = self.run_link(peer.clone(), sink, source, true).await {
                        self.table.report(e);
                    }
                    // The peer may still be served by the link it dialed.
                    while self.table.state(&peer) == Some(PeerState::Open) {
                        tokio::time::sleep(self.backoff.max).await;
                    }
                }
                Err(e) => self.table.report(e),
            }
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn dial_once(&self, addr: &str) -> Result<(ReplicaId, WsSink, WsSource), PeerError> {
        let failed = |e: &dyn std::fmt::Display| PeerError::Unreachable {
            target: addr.to_string(),
            reason: e.to_string(),
        };
        let stream = TcpStream::connect(addr).await.map_err(|e| failed(&e))?;
        let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), stream)
            .await
            .map_err(|e| failed(&e))?;
        let (mut sink, mut source) = ws.split();

        let hello = WireMessage::hello(self.table.local().clone(), "").encode()?;
        sink.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| failed(&e))?;
        let peer = self.read_hello(&mut source).await?;
        Ok((peer, sink, source))
    }

    async fn send_hello(&self, sink: &mut WsSink, peer: &ReplicaId) -> Result<(), PeerError> {
        let hello = WireMessage::hello(self.table.local().clone(), "").encode()?;
        sink.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| PeerError::Transport {
                peer: peer.clone(),
                reason: e.to_string(),
            })
    }

    async fn read_hello(&self, source: &mut WsSource) -> Result<ReplicaId, PeerError> {
        let read = async {
            loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let msg = match WireMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => return Err(PeerError::from(e)),
                        };
                        if msg.msg_type == MessageType::Hello {
                            return Ok(msg.sender);
                        }
                        log::warn!("Expected hello, got {:?}", msg.msg_type);
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        return Err(PeerError::Protocol(ProtocolError::ConnectionClosed));
                    }
                    _ => {}
                }
            }
        };
        tokio::time::timeout(self.handshake_timeout, read)
            .await
            .map_err(|_| PeerError::Protocol(ProtocolError::Timeout))?
    }

    /// Pump one established link until it ends or is superseded.
    async fn run_link(
        &self,
        peer: ReplicaId,
        mut sink: WsSink,
        mut source: WsSource,
        dialed: bool,
    ) -> Result<(), PeerError> {
        let link = self.table.next_link_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let local = self.table.local();
        let preferred = if dialed { local < &peer } else { &peer < local };
        let opened = if preferred {
            self.table.replace(peer.clone(), link, tx)
        } else {
            self.table.open(peer.clone(), link, tx)
        };
        if !opened {
            log::debug!("Dropping duplicate link to {peer}");
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        }

        let transport_error = |reason: String| PeerError::Transport {
            peer: peer.clone(),
            reason,
        };

        let result = loop {
            tokio::select! {
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match PeerFrame::decode(&bytes) {
                                Ok(frame) => self.table.deliver(&peer, frame),
                                Err(e) => self.table.report(PeerError::Malformed {
                                    peer: peer.clone(),
                                    reason: e.to_string(),
                                }),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                break Err(transport_error(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Err(e)) => break Err(transport_error(e.to_string())),
                        _ => {}
                    }
                }

                out = rx.recv() => {
                    let Some(out) = out else {
                        // Superseded or closed locally.
                        let _ = sink.send(Message::Close(None)).await;
                        break Ok(());
                    };
                    let bytes = match out.frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("Failed to encode frame for {peer}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        break Err(transport_error(e.to_string()));
                    }
                }
            }
        };

        self.table.close(&peer, link);
        result
    }
}
