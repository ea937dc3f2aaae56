//! WebSocket protocol types for persistent chat sessions.
//!
//! # Protocol Overview
//!
//! Messages are JSON objects with a `type` field that determines their structure.
//!
//! ## Session Flow
//!
//! 1. Client connects to the `/ws` endpoint
//! 2. Server opens a session and sends `SessionOpened`
//! 3. Client sends `Submit` messages; each gets `Accepted` or `Rejected`
//! 4. Server streams `Result` / `Error` messages as requests resolve
//! 5. Client may `Cancel` a request or `Close` the session
//! 6. Closing the socket closes the session and cancels anything outstanding
//!
//! A text frame that is not valid JSON is treated as a plain `Submit` of its
//! contents, so bare text clients keep working.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Priority;

/// Identifier of a persistent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a prompt on this session.
    Submit {
        input_text: String,
        #[serde(default)]
        deadline_ms: Option<u64>,
        #[serde(default)]
        priority: Option<Priority>,
    },
    /// Cancel a previously accepted request.
    Cancel { request_id: u64 },
    /// Close the session; outstanding requests are cancelled.
    Close,
}

impl ClientMessage {
    /// Parse a text frame, falling back to a plain submit for non-JSON text.
    pub fn from_text(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|_| ClientMessage::Submit {
            input_text: text.to_string(),
            deadline_ms: None,
            priority: None,
        })
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session registered for this connection.
    SessionOpened { session_id: SessionId },
    /// Submission admitted.
    Accepted { request_id: u64 },
    /// Submission refused at admission.
    Rejected {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Request completed successfully.
    Result { request_id: u64, response: String },
    /// Request failed, timed out or was cancelled.
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        code: String,
        message: String,
        retryable: bool,
    },
}
