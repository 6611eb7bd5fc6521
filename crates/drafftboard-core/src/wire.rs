//! JSON envelopes exchanged between sessions over a relay.

use crate::error::{SyncError, SyncResult};
use crate::presence::{ConnectionId, PresenceState};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Messages broadcast to every other connection in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// A connection entered the room. Peers answer with a snapshot and their presence.
    Join { room: String, from: ConnectionId },
    /// Replica update or snapshot, base64 encoded.
    Sync {
        room: String,
        from: ConnectionId,
        data: String,
    },
    /// Full presence state of the sender.
    Awareness {
        room: String,
        from: ConnectionId,
        state: PresenceState,
    },
    /// A connection left the room.
    Leave { room: String, from: ConnectionId },
}

impl WireMessage {
    pub fn sync(room: &str, from: &str, bytes: &[u8]) -> Self {
        WireMessage::Sync {
            room: room.to_string(),
            from: from.to_string(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn room(&self) -> &str {
        match self {
            WireMessage::Join { room, .. }
            | WireMessage::Sync { room, .. }
            | WireMessage::Awareness { room, .. }
            | WireMessage::Leave { room, .. } => room,
        }
    }

    pub fn from(&self) -> &str {
        match self {
            WireMessage::Join { from, .. }
            | WireMessage::Sync { from, .. }
            | WireMessage::Awareness { from, .. }
            | WireMessage::Leave { from, .. } => from,
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Decode the payload of a `Sync` message.
pub fn decode_payload(data: &str) -> SyncResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| SyncError::Wire(format!("Invalid base64 payload: {}", e)))
}
