//! Error types for the event handler.

use thiserror::Error;

use concord_core::{AuthError, CoreError, EventId, RoomId, ValidationError};
use concord_federation::FetchError;
use concord_stateres::StateResError;
use concord_store::StoreError;

/// Errors that stop an event from being processed.
///
/// An event that fails the auth rules is not an error: it is persisted as
/// rejected and reported through the processing outcome.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The event can never be valid in its room version.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed identifiers or event JSON.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The engine was called with inputs that break its preconditions.
    #[error("engine invariant violated: {0}")]
    Invariant(AuthError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// State resolution could not complete.
    #[error("state resolution error: {0}")]
    StateRes(#[from] StateResError),

    /// A remote server could not supply a missing event.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Events for a room whose create event we do not have.
    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),

    /// The auth events of a batch depend on each other in a cycle.
    #[error("auth dependency cycle among {0:?}")]
    AuthCycle(Vec<EventId>),

    /// The event cannot be decided for now. Nothing was persisted.
    #[error("cannot process {event_id} yet: {reason}")]
    Unprocessable { event_id: EventId, reason: String },
}

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;
