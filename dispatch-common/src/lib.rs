//! Chat Dispatch Common Types
//!
//! Wire types shared by the dispatcher's HTTP/websocket surface and its clients.

pub mod chat;
pub mod protocol;

pub use chat::{ChatRequest, ChatResponse, ErrorBody, ErrorDetail, Priority};
pub use protocol::{ClientMessage, ServerMessage, SessionId};
