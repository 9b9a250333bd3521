//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id  │ world_id │ clock    │ op_id    │ payload  │
//! │ 1 byte   │ 16 bytes │ 16 bytes │ varint   │ 16 bytes │ variable │
//! └──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake and steady state:
//! ```text
//!   client                                server
//!     │── PeerJoined { PeerInfo } ──────────►│  resolve role
//!     │◄──────────── SyncStep2 { state } ────│
//!     │◄──────────── SyncStep1 { sv } ───────│
//!     │── Delta { op_id, update } ──────────►│  apply, persist
//!     │◄──────────── Ack { op_id } ──────────│  (or Rejected)
//!     │◄──────────── Delta (other peers) ────│
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector of the sender
    SyncStep1 = 1,
    /// Update carrying what the receiver lacks
    SyncStep2 = 2,
    /// Incremental update from one peer
    Delta = 3,
    /// Server accepted the delta with `op_id`
    Ack = 4,
    /// Server refused the delta with `op_id`; payload is the reason
    Rejected = 5,
    PeerJoined = 6,
    PeerLeft = 7,
    Ping = 8,
    Pong = 9,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// Authenticated user id; decides the peer's role in the world.
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub world_id: Uuid,
    /// Sender's local clock after the update, zero when not applicable
    pub clock: u64,
    /// Client operation id for Delta/Ack/Rejected, nil otherwise
    pub op_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, world_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            world_id,
            clock: 0,
            op_id: Uuid::nil(),
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, world_id: Uuid, op_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            clock,
            op_id,
            ..Self::new(MessageType::Delta, peer_id, world_id, update)
        }
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(peer_id: Uuid, world_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, world_id, state_vector)
    }

    /// Create a sync step 2 (state diff).
    pub fn sync_step2(peer_id: Uuid, world_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, world_id, state_diff)
    }

    pub fn ack(peer_id: Uuid, world_id: Uuid, op_id: Uuid) -> Self {
        Self {
            op_id,
            ..Self::new(MessageType::Ack, peer_id, world_id, Vec::new())
        }
    }

    pub fn rejected(peer_id: Uuid, world_id: Uuid, op_id: Uuid, reason: &str) -> Self {
        Self {
            op_id,
            ..Self::new(MessageType::Rejected, peer_id, world_id, reason.as_bytes().to_vec())
        }
    }

    /// Create a peer joined notification.
    pub fn peer_joined(world_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, world_id, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, world_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, world_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), Vec::new())
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

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    /// Reason carried by a `Rejected` message.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
