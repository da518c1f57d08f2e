//! Error types for the chat server
//!
//! Defines process-level errors, business errors reported back to the
//! client, and transport write errors. Uses thiserror for ergonomic
//! error definitions.

use std::time::Duration;

use thiserror::Error;

use crate::types::RoomId;

/// Application-level errors
///
/// Fatal for the operation that raised them; never sent to a client as
/// an ack envelope.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Client did not complete the WebSocket upgrade in time
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Listener could not be bound after all retries
    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Query for a room that does not exist
    #[error("no room found: {0}")]
    RoomNotFound(i64),

    /// Query for a user that is not online
    #[error("no player found: {0}")]
    PlayerNotFound(String),
}

/// Response codes carried in the `code` field of an ack envelope
///
/// Zero is success, negative codes are ignorable conditions and positive
/// codes are server-classified error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    /// Request ignored, nothing changed
    Ignore,
    /// User name already taken
    NameRepeat,
    Custom,
    ServerInternal,
    /// Client sent bad data
    ServerCdata,
    /// Client message could not be processed
    ServerCmsg,
}

impl ErrorCode {
    pub fn value(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Ignore => -1,
            ErrorCode::NameRepeat => -2,
            ErrorCode::Custom => 100_000,
            ErrorCode::ServerInternal => 100_001,
            ErrorCode::ServerCdata => 100_002,
            ErrorCode::ServerCmsg => 100_003,
        }
    }
}

/// Business errors raised while handling one request
///
/// The connection stays open; the client receives an ack envelope with
/// the matching code and this error's message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("you are logout,refresh page(F5)")]
    LoggedOut,

    #[error("you are in the chat room")]
    AlreadyInRoom,

    #[error("repeated name,change name please")]
    NameRepeated,

    #[error("userName is required")]
    NameRequired,

    #[error("you haven not logged in yet")]
    NotLoggedIn,

    #[error("not found new room")]
    RoomNotFound,

    #[error("no found chat room,refresh page(F5)")]
    NotInRoom,

    #[error("room {0} is unavailable")]
    RoomClosed(RoomId),

    #[error("invalid request data: {0}")]
    InvalidData(#[from] serde_json::Error),

    #[error("unsupported message type: {0}")]
    UnsupportedType(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::AlreadyInRoom => ErrorCode::Ignore,
            HandlerError::NameRepeated => ErrorCode::NameRepeat,
            HandlerError::UnsupportedType(_) => ErrorCode::ServerCmsg,
            HandlerError::Internal(_) => ErrorCode::ServerInternal,
            _ => ErrorCode::ServerCdata,
        }
    }
}

/// Errors from one physical write on a session
#[derive(Debug, Error)]
pub enum WriteError {
    /// Write deadline exceeded
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session already closed
    #[error("session closed")]
    Closed,
}

impl WriteError {
    /// Whether the write may succeed if attempted again
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            WriteError::Timeout(_) => true,
            WriteError::WebSocket(WsError::Io(e)) => matches!(
                e.kind(),
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
