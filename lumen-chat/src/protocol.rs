//! Frames spoken on the live WebSocket.
//!
//! Wire format (JSON text frame, adjacently tagged):
//! ```text
//! { "type": "message", "payload": { "id": "...", "roomId": "...", ... } }
//! { "type": "ping" }
//! ```
//!
//! Client → server: `join`, `leave`, `send`, `ping`.
//! Server → client: `message`, `ack`, `error`, `pong`.

use lumen_core::{Message, MessageDraft, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A room reference used by `join` and `leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// Client request to post a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Correlates the request with its `ack` or `error`.
    pub client_msg_id: String,
    pub room_id: RoomId,
    pub draft: MessageDraft,
}

/// Server confirmation of a `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub in_reply_to: String,
    pub message: Message,
}

/// Server-side rejection. `in_reply_to` is absent for out-of-band errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub code: String,
    pub message: String,
}

/// Top-level live feed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum LiveFrame {
    Join(RoomRef),
    Leave(RoomRef),
    Send(SendRequest),
    Message(Message),
    Ack(Ack),
    Error(ErrorFrame),
    Ping,
    Pong,
}

impl LiveFrame {
    pub fn join(room_id: RoomId) -> Self {
        Self::Join(RoomRef { room_id })
    }

    pub fn leave(room_id: RoomId) -> Self {
        Self::Leave(RoomRef { room_id })
    }

    pub fn send(client_msg_id: impl Into<String>, room_id: RoomId, draft: MessageDraft) -> Self {
        Self::Send(SendRequest {
            client_msg_id: client_msg_id.into(),
            room_id,
            draft,
        })
    }

    /// Frame name as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Send(_) => "send",
            Self::Message(_) => "message",
            Self::Ack(_) => "ack",
            Self::Error(_) => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}
