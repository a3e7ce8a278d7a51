//! Error types for the federation module.

use std::time::Duration;

use thiserror::Error;

use concord_core::EventId;

/// Errors from fetching events over federation.
///
/// None of these say anything about the event's validity. An event that
/// could not be fetched is undecided, never rejected.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote did not answer in time.
    #[error("timed out after {after:?} fetching {event_id}")]
    Timeout { event_id: EventId, after: Duration },

    /// The remote does not have the event.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// The remote sent something that is not the requested event.
    #[error("invalid event from remote: {0}")]
    InvalidEvent(String),

    /// The remote sent more auth events than we accept.
    #[error("auth chain of {len} events exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for federation operations.
pub type Result<T> = std::result::Result<T, FetchError>;
