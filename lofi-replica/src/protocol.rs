//! Binary wire envelope for scope synchronization.
//!
//! Every frame exchanged between a transport binding and the relay is
//! one bincode-encoded [`WireMessage`]:
//!
//! ```text
//! ┌──────────┬─────────────┬─────────┬─────────┬──────────┐
//! │ msg_type │ participant │ scope   │ clock   │ payload  │
//! │ 1 byte   │ 16 bytes    │ string  │ 8 bytes │ variable │
//! └──────────┴─────────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Document payloads are opaque merge-engine v1 updates. Presence
//! payloads are JSON bytes (presence is schema-free, so it cannot ride
//! the non-self-describing bincode encoding directly).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Participant entered a scope; payload is its presence JSON.
    Join = 1,
    /// Participant left a scope (clean disconnect).
    Leave = 2,
    /// State vector handshake request.
    SyncStep1 = 3,
    /// State diff handshake response.
    SyncStep2 = 4,
    /// Incremental merge-engine update.
    Delta = 5,
    /// Presence broadcast; payload is the full presence JSON.
    Presence = 6,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    /// Sender identity. Receivers drop their own frames on fan-out.
    pub participant: Uuid,
    /// Scope name routing the frame to a relay room.
    pub scope: String,
    /// Lamport clock for delta ordering diagnostics.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn join(participant: Uuid, scope: impl Into<String>, presence_json: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Join,
            participant,
            scope: scope.into(),
            clock: 0,
            payload: presence_json,
        }
    }

    pub fn leave(participant: Uuid, scope: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Leave,
            participant,
            scope: scope.into(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn sync_step1(participant: Uuid, scope: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            participant,
            scope: scope.into(),
            clock: 0,
            payload: state_vector,
        }
    }

    pub fn sync_step2(participant: Uuid, scope: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            participant,
            scope: scope.into(),
            clock: 0,
            payload: state_diff,
        }
    }

    pub fn delta(participant: Uuid, scope: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            participant,
            scope: scope.into(),
            clock,
            payload: update,
        }
    }

    pub fn presence(participant: Uuid, scope: impl Into<String>, presence_json: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Presence,
            participant,
            scope: scope.into(),
            clock: 0,
            payload: presence_json,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("wire encode failed: {0}")]
    Encode(String),
    #[error("wire decode failed: {0}")]
    Decode(String),
    #[error("connection closed")]
    ConnectionClosed,
}
