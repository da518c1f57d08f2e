//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: monotonically assigned connection identifier
//! - `RoomId`: 1-based chat room number
//! - `RoomState`: where a client currently is (offline, lobby or a room)

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique session identifier (newtype pattern)
///
/// Assigned from a process-wide counter when a connection is upgraded.
/// Implements Hash and Eq for use as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate the next session ID
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room number, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u32);

impl RoomId {
    /// Raw value as used on the wire
    pub fn get(self) -> i64 {
        i64::from(self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a client currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Disconnected or evicted from the registry
    Offline,
    /// Connected but not logged in yet
    Lobby,
    /// Logged in and joined to a room
    InRoom(RoomId),
}

impl RoomState {
    /// The joined room, if any
    pub fn room(self) -> Option<RoomId> {
        match self {
            RoomState::InRoom(id) => Some(id),
            _ => None,
        }
    }

    /// Wire value: -1 offline, 0 lobby, room number otherwise
    pub fn to_raw(self) -> i64 {
        match self {
            RoomState::Offline => -1,
            RoomState::Lobby => 0,
            RoomState::InRoom(id) => id.get(),
        }
    }

    /// Inverse of [`RoomState::to_raw`]. Any negative value decodes as offline.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => RoomState::Lobby,
            r if r > 0 => RoomState::InRoom(RoomId(r as u32)),
            _ => RoomState::Offline,
        }
    }
}
