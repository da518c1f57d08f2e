//! Client agent definition
//!
//! Represents one chat participant: the session it talks through, the
//! name chosen at login and the room it is currently in.

use std::sync::{Arc, OnceLock};

use tokio_tungstenite::tungstenite::Message;

use crate::atomic::AtomicRoomState;
use crate::session::Session;
use crate::types::{RoomState, SessionId};

/// Connected chat participant
///
/// Owned by the client registry; rooms only hold weak references.
#[derive(Debug)]
pub struct ClientAgent {
    /// Transport for this participant
    pub session: Arc<Session>,
    /// Display name, set once at login
    user_name: OnceLock<String>,
    /// Offline, lobby or the joined room
    pub state: AtomicRoomState,
}

impl ClientAgent {
    /// Create a new agent in the lobby
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            user_name: OnceLock::new(),
            state: AtomicRoomState::new(RoomState::Lobby),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Queue a message to this client
    ///
    /// Returns false if the session is closed or was closed because its
    /// outbound mailbox overflowed.
    pub async fn send(&self, msg: Message) -> bool {
        self.session.enqueue_send(msg).await
    }

    /// Get the display name for this client
    ///
    /// Returns an empty string before login.
    pub fn display_name(&self) -> &str {
        self.user_name.get().map(String::as_str).unwrap_or_default()
    }

    /// Check if this client has logged in with a name
    pub fn has_username(&self) -> bool {
        self.user_name.get().is_some()
    }

    /// Set the client's name. Only the first call has any effect.
    pub fn set_username(&self, user_name: String) -> bool {
        self.user_name.set(user_name).is_ok()
    }

    pub fn room_state(&self) -> RoomState {
        self.state.load()
    }

    /// Whether the client is online and not logged out
    pub fn is_active(&self) -> bool {
        !self.session.is_closed() && self.state.load() != RoomState::Offline
    }
}
