//! Lock-free state cells
//!
//! A client's room state is read by its room loop and written by its
//! handler without any mutex. The tagged [`RoomState`] is packed into a
//! single `AtomicI64` (-1 offline, 0 lobby, room number otherwise).

use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::RoomState;

/// Atomic cell holding a [`RoomState`]
#[derive(Debug)]
pub struct AtomicRoomState(AtomicI64);

impl AtomicRoomState {
    pub fn new(state: RoomState) -> Self {
        Self(AtomicI64::new(state.to_raw()))
    }

    pub fn load(&self) -> RoomState {
        RoomState::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: RoomState) {
        self.0.store(state.to_raw(), Ordering::Release);
    }

    /// Store `state` and return the previous value
    pub fn swap(&self, state: RoomState) -> RoomState {
        RoomState::from_raw(self.0.swap(state.to_raw(), Ordering::AcqRel))
    }

    /// Replace `current` with `new` only if the cell still holds `current`.
    ///
    /// Returns the value observed in the cell.
    pub fn compare_exchange(&self, current: RoomState, new: RoomState) -> Result<RoomState, RoomState> {
        self.0
            .compare_exchange(
                current.to_raw(),
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(RoomState::from_raw)
            .map_err(RoomState::from_raw)
    }
}

impl Default for AtomicRoomState {
    fn default() -> Self {
        Self::new(RoomState::Lobby)
    }
}
