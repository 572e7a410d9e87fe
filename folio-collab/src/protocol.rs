//! Binary wire protocol for peer links and the relay.
//!
//! Two layers, both bincode-encoded:
//!
//! ```text
//! ┌──────────── WireMessage (link / relay control) ────────────┐
//! │ msg_type │ sender │ room │ target? │ payload               │
//! └──────────────────────────────────────┬─────────────────────┘
//!                                        │ Forward payload
//!                         ┌──────────────▼──────────────┐
//!                         │ PeerFrame                   │
//!                         │ sender │ correlation? │ body│
//!                         └─────────────────────────────┘
//! ```
//!
//! Direct links exchange a `Hello` and then raw `PeerFrame`s. Relayed links
//! wrap every `PeerFrame` in a `Forward` addressed to one member of the room.

use folio_core::ReplicaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender id the relay uses for the messages it originates.
pub const RELAY_SENDER: &str = "relay";

/// Message types for links and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on every connection: who am I, which room
    Hello = 1,
    /// Relay → joiner: members already in the room
    Roster = 2,
    /// Relay → members: someone joined
    PeerJoined = 3,
    /// Relay → members: someone left
    PeerLeft = 4,
    /// Opaque peer frame, optionally addressed to one member
    Forward = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level link message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub sender: ReplicaId,
    /// Room name; empty on direct links
    pub room: String,
    /// Single recipient, `None` = every other member
    pub target: Option<ReplicaId>,
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn control(msg_type: MessageType, sender: ReplicaId, room: impl Into<String>) -> Self {
        Self {
            msg_type,
            sender,
            room: room.into(),
            target: None,
            payload: Vec::new(),
        }
    }

    /// Create a hello (join) message.
    pub fn hello(sender: ReplicaId, room: impl Into<String>) -> Self {
        Self::control(MessageType::Hello, sender, room)
    }

    /// Create a roster listing the members already present.
    pub fn roster(room: impl Into<String>, members: &[ReplicaId]) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(members, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            payload,
            ..Self::control(MessageType::Roster, ReplicaId::from(RELAY_SENDER), room)
        })
    }

    /// Create a peer joined notification.
    pub fn peer_joined(peer: ReplicaId, room: impl Into<String>) -> Self {
        Self::control(MessageType::PeerJoined, peer, room)
    }

    /// Create a peer left notification.
    pub fn peer_left(peer: ReplicaId, room: impl Into<String>) -> Self {
        Self::control(MessageType::PeerLeft, peer, room)
    }

    /// Create a forward carrying an encoded [`PeerFrame`].
    pub fn forward(
        sender: ReplicaId,
        room: impl Into<String>,
        target: Option<ReplicaId>,
        frame: Vec<u8>,
    ) -> Self {
        Self {
            target,
            payload: frame,
            ..Self::control(MessageType::Forward, sender, room)
        }
    }

    /// Create a ping message.
    pub fn ping(sender: ReplicaId) -> Self {
        Self::control(MessageType::Ping, sender, "")
    }

    /// Create a pong message.
    pub fn pong(sender: ReplicaId) -> Self {
        Self::control(MessageType::Pong, sender, "")
    }

    /// Whether a room member `member` should receive this message.
    pub fn is_for(&self, member: &ReplicaId) -> bool {
        &self.sender != member && self.target.as_ref().map_or(true, |t| t == member)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse roster payload.
    pub fn members(&self) -> Result<Vec<ReplicaId>, ProtocolError> {
        if self.msg_type != MessageType::Roster {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (members, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(members)
    }
}

/// Body of a peer frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    /// Unsolicited message, or a request when a correlation is attached
    Content(Vec<u8>),
    /// Reply to the request carrying the same correlation
    Result(Vec<u8>),
}

/// Envelope exchanged between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFrame {
    pub sender: ReplicaId,
    pub correlation: Option<u64>,
    pub body: FrameBody,
}

impl PeerFrame {
    pub fn message(sender: ReplicaId, payload: Vec<u8>) -> Self {
        Self {
            sender,
            correlation: None,
            body: FrameBody::Content(payload),
        }
    }

    pub fn request(sender: ReplicaId, correlation: u64, payload: Vec<u8>) -> Self {
        Self {
            sender,
            correlation: Some(correlation),
            body: FrameBody::Content(payload),
        }
    }

    pub fn response(sender: ReplicaId, correlation: u64, payload: Vec<u8>) -> Self {
        Self {
            sender,
            correlation: Some(correlation),
            body: FrameBody::Result(payload),
        }
    }

    /// Responses are recognized by their body, not by bookkeeping.
    pub fn is_response(&self) -> bool {
        matches!(self.body, FrameBody::Result(_))
    }

    pub fn payload(&self) -> &[u8] {
        match &self.body {
            FrameBody::Content(bytes) | FrameBody::Result(bytes) => bytes,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self.body {
            FrameBody::Content(bytes) | FrameBody::Result(bytes) => bytes,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::from(s)
    }

    #[test]
    fn test_forward_roundtrip() {
        let frame = PeerFrame::message(id("alice"), vec![1, 2, 3]).encode().unwrap();
        let msg = WireMessage::forward(id("alice"), "room-1", Some(id("bob")), frame.clone());
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Forward);
        assert_eq!(decoded.sender, id("alice"));
        assert_eq!(decoded.room, "room-1");
        assert_eq!(decoded.target, Some(id("bob")));
        assert_eq!(PeerFrame::decode(&decoded.payload).unwrap().payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_roster_members() {
        let members = vec![id("a"), id("b")];
        let msg = WireMessage::roster("r", &members).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.members().unwrap(), members);
        assert_eq!(decoded.sender, id(RELAY_SENDER));
    }

    #[test]
    fn test_members_wrong_type() {
        let msg = WireMessage::hello(id("a"), "r");
        assert_eq!(msg.members(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_is_for_filters_sender_and_target() {
        let broadcast = WireMessage::forward(id("a"), "r", None, vec![]);
        assert!(!broadcast.is_for(&id("a")));
        assert!(broadcast.is_for(&id("b")));

        let addressed = WireMessage::forward(id("a"), "r", Some(id("b")), vec![]);
        assert!(addressed.is_for(&id("b")));
        assert!(!addressed.is_for(&id("c")));
    }

    #[test]
    fn test_frame_classification() {
        assert!(!PeerFrame::message(id("a"), vec![]).is_response());
        assert!(!PeerFrame::request(id("a"), 4, vec![]).is_response());

        let response = PeerFrame::response(id("a"), 4, vec![9]);
        let decoded = PeerFrame::decode(&response.encode().unwrap()).unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.correlation, Some(4));
        assert_eq!(decoded.into_payload(), vec![9]);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(WireMessage::decode(&garbage).is_err());
        assert!(PeerFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_forward_overhead_small() {
        let msg = WireMessage::forward(id("replica-0001"), "room", None, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::Roster as u8, 2);
        assert_eq!(MessageType::PeerJoined as u8, 3);
        assert_eq!(MessageType::PeerLeft as u8, 4);
        assert_eq!(MessageType::Forward as u8, 5);
        assert_eq!(MessageType::Ping as u8, 6);
        assert_eq!(MessageType::Pong as u8, 7);
    }
}
