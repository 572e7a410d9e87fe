//! Relayed transport: a WebSocket client of [`crate::relay::RelayServer`].
//!
//! One session per relay connection. Every peer learned from the roster or a
//! join announcement shares the session's link id, so losing the relay closes
//! all of them at once. The supervisor then reconnects with backoff.

use std::sync::Arc;
use std::time::Duration;

use folio_core::ReplicaId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::peers::{LinkSender, Outbound, PeerTable};
use super::{Backoff, ConnectionOptions, PeerError, PeerState, TaskSet};
use crate::protocol::{MessageType, PeerFrame, WireMessage};

pub(crate) fn start(
    url: String,
    room: String,
    options: &ConnectionOptions,
    table: Arc<PeerTable>,
    tasks: &TaskSet,
) {
    let backoff = options.backoff.clone();
    let heartbeat = options.heartbeat;
    tasks.spawn(async move { supervise(url, room, backoff, heartbeat, table).await });
}

async fn supervise(
    url: String,
    room: String,
    backoff: Backoff,
    heartbeat: Duration,
    table: Arc<PeerTable>,
) {
    let mut attempt: u32 = 0;
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                let session = table.next_link_id();
                log::info!("{} joined relay room {room} at {url}", table.local());

                let reason = match run_session(ws, session, &room, heartbeat, &table).await {
                    Ok(()) => "relay closed the connection".to_string(),
                    Err(e) => e.to_string(),
                };
                let dropped = table.close_link(session);
                log::warn!(
                    "Lost relay {url} ({reason}); closed {} relayed peers",
                    dropped.len()
                );
                table.report(PeerError::SignalingLost(reason));
            }
            Err(e) => {
                table.report(PeerError::SignalingLost(format!("{url}: {e}")));
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        log::debug!("Reconnecting to relay in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

fn signaling(e: impl std::fmt::Display) -> PeerError {
    PeerError::SignalingLost(e.to_string())
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    session: u64,
    room: &str,
    heartbeat: Duration,
    table: &Arc<PeerTable>,
) -> Result<(), PeerError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let local = table.local().clone();

    let hello = WireMessage::hello(local.clone(), room).encode()?;
    sink.send(Message::Binary(hello.into()))
        .await
        .map_err(signaling)?;

    // Shared by every peer of this session.
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<Outbound>();

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        handle_relay_message(&bytes, session, &link_tx, table);
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(signaling(e)),
                    _ => {}
                }
            }

            Some(out) = link_rx.recv() => {
                let frame = out.frame.encode()?;
                let wire = WireMessage::forward(local.clone(), room, Some(out.to), frame);
                sink.send(Message::Binary(wire.encode()?.into()))
                    .await
                    .map_err(signaling)?;
            }

            _ = ticker.tick() => {
                let ping = WireMessage::ping(local.clone()).encode()?;
                sink.send(Message::Binary(ping.into()))
                    .await
                    .map_err(signaling)?;
            }
        }
    }
}

fn handle_relay_message(bytes: &[u8], session: u64, link: &LinkSender, table: &PeerTable) {
    let wire = match WireMessage::decode(bytes) {
        Ok(wire) => wire,
        Err(e) => {
            table.report(PeerError::Malformed {
                peer: ReplicaId::from(crate::protocol::RELAY_SENDER),
                reason: e.to_string(),
            });
            return;
        }
    };

    match wire.msg_type {
        MessageType::Roster => match wire.members() {
            Ok(members) => {
                for peer in members {
                    table.open(peer, session, link.clone());
                }
            }
            Err(e) => table.report(PeerError::Malformed {
                peer: wire.sender,
                reason: e.to_string(),
            }),
        },
        MessageType::PeerJoined => {
            table.open(wire.sender, session, link.clone());
        }
        MessageType::PeerLeft => {
            table.close(&wire.sender, session);
        }
        MessageType::Forward => {
            if table.state(&wire.sender) != Some(PeerState::Open) {
                log::debug!("Dropping frame from unannounced peer {}", wire.sender);
                return;
            }
            match PeerFrame::decode(&wire.payload) {
                Ok(frame) => table.deliver(&wire.sender, frame),
                Err(e) => table.report(PeerError::Malformed {
                    peer: wire.sender,
                    reason: e.to_string(),
                }),
            }
        }
        MessageType::Pong => {}
        other => log::debug!("Ignoring {other:?} from relay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::from(s)
    }

    #[test]
    fn test_roster_and_departures() {
        let (table, mut events) = PeerTable::new(id("me"));
        let (link, _rx) = mpsc::unbounded_channel();

        let roster = WireMessage::roster("doc", &[id("a"), id("b")]).unwrap();
        handle_relay_message(&roster.encode().unwrap(), 4, &link, &table);
        assert_eq!(table.open_peers(), vec![id("a"), id("b")]);

        let left = WireMessage::peer_left(id("a"), "doc");
        handle_relay_message(&left.encode().unwrap(), 4, &link, &table);
        assert_eq!(table.open_peers(), vec![id("b")]);

        // A departure from an older session does not close the peer.
        let joined = WireMessage::peer_joined(id("c"), "doc");
        handle_relay_message(&joined.encode().unwrap(), 4, &link, &table);
        let stale = WireMessage::peer_left(id("c"), "doc");
        handle_relay_message(&stale.encode().unwrap(), 3, &link, &table);
        assert_eq!(table.open_peers(), vec![id("b"), id("c")]);

        assert_eq!(events.disconnect.try_recv().unwrap(), id("a"));
    }

    #[test]
    fn test_forward_delivery() {
        let (table, mut events) = PeerTable::new(id("me"));
        let (link, _rx) = mpsc::unbounded_channel();

        let frame = PeerFrame::message(id("a"), vec![3]).encode().unwrap();
        let forward = WireMessage::forward(id("a"), "doc", Some(id("me")), frame);

        // Not announced yet: dropped.
        handle_relay_message(&forward.encode().unwrap(), 1, &link, &table);
        assert!(events.message.try_recv().is_err());

        let joined = WireMessage::peer_joined(id("a"), "doc");
        handle_relay_message(&joined.encode().unwrap(), 1, &link, &table);
        handle_relay_message(&forward.encode().unwrap(), 1, &link, &table);
        assert_eq!(events.message.try_recv().unwrap().payload, vec![3]);
    }

    #[test]
    fn test_malformed_is_reported() {
        let (table, mut events) = PeerTable::new(id("me"));
        let (link, _rx) = mpsc::unbounded_channel();
        handle_relay_message(&[0xFF, 0x00], 1, &link, &table);
        assert!(matches!(
            events.error.try_recv().unwrap(),
            PeerError::Malformed { .. }
        ));
    }
}
