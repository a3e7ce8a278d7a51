//! Error types for state resolution.

use thiserror::Error;

use concord_core::{EventId, RoomId};
use concord_store::StoreError;

/// Errors that stop a state resolution.
///
/// None of these are recoverable by picking one of the input states: the
/// caller must retry later or give up on the event.
#[derive(Debug, Error)]
pub enum StateResError {
    /// An event the comparison needs is neither supplied nor stored.
    #[error("event {0} needed for state resolution is unavailable")]
    MissingEvent(EventId),

    /// An input event belongs to another room.
    #[error("event {event_id} is in room {found}, resolving {expected}")]
    CrossRoomEvent {
        event_id: EventId,
        expected: RoomId,
        found: RoomId,
    },

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for state resolution.
pub type Result<T> = std::result::Result<T, StateResError>;
