//! # Client Control Protocol
//!
//! JSON messages exchanged with the caller on the call WebSocket, next to
//! the binary audio frames. Every message carries a `type` field.
//!
//! ## Server -> Client:
//! - `connected`: socket accepted, session created
//! - `ready`: audio pipelines running, start speaking
//! - `status`: sidecar connection changed (`connected`, `degraded`, ...)
//! - `error`: structured failure with a machine-readable `code`
//! - `ping` / `pong`: heartbeat
//! - `session_ended`: final summary before the socket closes
//!
//! ## Client -> Server:
//! - `ping` / `pong`: heartbeat
//! - `reset_playback`: drop buffered agent audio
//! - `end_call`: hang up

use crate::relay::events::SessionSummary;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        tenant_id: String,
        message: String,
    },
    Ready {
        session_id: String,
        message: String,
    },
    Status {
        state: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    SessionEnded {
        summary: SessionSummary,
    },
}

impl ServerMessage {
    pub fn status(state: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Status { state: state.into(), message: message.into() }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error { code: code.into(), message: message.into() }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data, so serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

impl From<&RelayError> for ServerMessage {
    fn from(err: &RelayError) -> Self {
        ServerMessage::error(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    ResetPlayback,
    EndCall,
}

impl ClientMessage {
    /// Parse a text frame. Unknown types and malformed JSON are protocol violations.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::ProtocolViolation(format!("{}: {}", e, truncate(text, 64))))
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// What the relay reads from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientInbound {
    /// Client-format audio bytes
    Audio(Vec<u8>),
    /// A text frame, parsed by the session
    Text(String),
}

/// What the relay writes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutbound {
    /// Client-format audio bytes
    Audio(Vec<u8>),
    Message(ServerMessage),
}
