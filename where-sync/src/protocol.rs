//! Signal protocol for incremental replication and presence heartbeats.
//!
//! Wire format (bincode-encoded `SignalEnvelope`):
//! ```text
//! ┌────────────────┬───────────┬──────────────────────────────┐
//! │ maybe_space_id │ from      │ message                      │
//! │ 1 + 32 bytes   │ 16 bytes  │ variant tag + payload        │
//! └────────────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! Signals are best-effort: delivery is at-most-once and unordered.
//! Anything that fails to decode is a malformed signal and is dropped
//! by the receiver.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{LocationSlot, Session};

/// Identity of a participating peer (agent).
pub type PeerId = Uuid;

/// Content hash identifying an entity, or a backend-assigned handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

/// Backend handle used to address a placed location for update/delete.
pub type LinkId = Hash;

impl Hash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of raw bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        let out = Sha256::digest(bytes);
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        Self(buf)
    }

    /// Content hash of a serializable entry (canonical bincode bytes).
    pub fn of_entry<T: Serialize>(entry: &T) -> Result<Self, ProtocolError> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::digest(&bytes))
    }

    /// Lowercase hex of the first 4 bytes, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

/// Discriminant of a [`SignalMessage`], used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 1,
    Pong = 2,
    NewHere = 3,
    DeleteHere = 4,
    NewSession = 5,
    NewSpace = 6,
    NewTemplate = 7,
    NewSvgMarker = 8,
    NewEmojiGroup = 9,
}

/// Closed set of peer signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Heartbeat request
    Ping,
    /// Heartbeat response
    Pong,
    /// A location was placed (or re-placed) by the sender
    NewHere(LocationSlot),
    /// A location was removed from a session
    DeleteHere { session_id: Hash, link_id: LinkId },
    /// A session was appended to the space in `maybe_space_id`
    NewSession { session_id: Hash, session: Session },
    NewSpace(Hash),
    NewTemplate(Hash),
    NewSvgMarker(Hash),
    NewEmojiGroup(Hash),
}

impl SignalMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalMessage::Ping => MessageKind::Ping,
            SignalMessage::Pong => MessageKind::Pong,
            SignalMessage::NewHere(_) => MessageKind::NewHere,
            SignalMessage::DeleteHere { .. } => MessageKind::DeleteHere,
            SignalMessage::NewSession { .. } => MessageKind::NewSession,
            SignalMessage::NewSpace(_) => MessageKind::NewSpace,
            SignalMessage::NewTemplate(_) => MessageKind::NewTemplate,
            SignalMessage::NewSvgMarker(_) => MessageKind::NewSvgMarker,
            SignalMessage::NewEmojiGroup(_) => MessageKind::NewEmojiGroup,
        }
    }

    /// Whether this message is a heartbeat (carries no replicated state).
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, SignalMessage::Ping | SignalMessage::Pong)
    }
}

/// Peer-addressed signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Space the message applies to, used for filtering
    pub maybe_space_id: Option<Hash>,
    pub from: PeerId,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(maybe_space_id: Option<Hash>, from: PeerId, message: SignalMessage) -> Self {
        Self {
            maybe_space_id,
            from,
            message,
        }
    }

    pub fn ping(maybe_space_id: Option<Hash>, from: PeerId) -> Self {
        Self::new(maybe_space_id, from, SignalMessage::Ping)
    }

    /// Heartbeat reply to `request`, echoing its space.
    pub fn pong_to(request: &SignalEnvelope, from: PeerId) -> Self {
        Self::new(request.maybe_space_id, from, SignalMessage::Pong)
    }

    pub fn new_here(space_id: Hash, from: PeerId, slot: LocationSlot) -> Self {
        Self::new(Some(space_id), from, SignalMessage::NewHere(slot))
    }

    pub fn delete_here(space_id: Hash, from: PeerId, session_id: Hash, link_id: LinkId) -> Self {
        Self::new(
            Some(space_id),
            from,
            SignalMessage::DeleteHere { session_id, link_id },
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, read) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(envelope)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after signal envelope")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coord, Location, LocationMeta};

    fn slot() -> LocationSlot {
        LocationSlot {
            location: Location {
                coord: Coord::new(10.0, 20.0),
                session_id: Hash::digest(b"session"),
                meta: LocationMeta::default(),
            },
            link_id: Hash::digest(b"link"),
            author_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_new_here_survives_the_wire() {
        let space = Hash::digest(b"space");
        let env = SignalEnvelope::new_here(space, Uuid::new_v4(), slot());
        let decoded = SignalEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.kind(), MessageKind::NewHere);
    }

    #[test]
    fn test_pong_echoes_space() {
        let space = Hash::digest(b"space");
        let ping = SignalEnvelope::ping(Some(space), Uuid::new_v4());
        let me = Uuid::new_v4();
        let pong = SignalEnvelope::pong_to(&ping, me);
        assert_eq!(pong.maybe_space_id, Some(space));
        assert_eq!(pong.from, me);
        assert_eq!(pong.message, SignalMessage::Pong);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SignalEnvelope::decode(&garbage).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let env = SignalEnvelope::ping(None, Uuid::new_v4());
        let mut bytes = env.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            SignalEnvelope::decode(&bytes),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_heartbeat_classification() {
        assert!(SignalMessage::Ping.is_heartbeat());
        assert!(SignalMessage::Pong.is_heartbeat());
        assert!(!SignalMessage::NewSpace(Hash::digest(b"s")).is_heartbeat());
    }

    #[test]
    fn test_message_kind_values() {
        assert_eq!(MessageKind::Ping as u8, 1);
        assert_eq!(MessageKind::Pong as u8, 2);
        assert_eq!(MessageKind::NewHere as u8, 3);
        assert_eq!(MessageKind::DeleteHere as u8, 4);
        assert_eq!(MessageKind::NewEmojiGroup as u8, 9);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Hash::of_entry(&("space", 1u32)).unwrap();
        let b = Hash::of_entry(&("space", 1u32)).unwrap();
        let c = Hash::of_entry(&("space", 2u32)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 64);
        assert_eq!(a.short().len(), 8);
    }
}
