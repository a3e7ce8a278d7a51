//! The federation client abstraction.
//!
//! The engine only needs to pull individual events and auth chains from
//! other servers. How requests reach them is up to the implementation.

use std::sync::Arc;

use async_trait::async_trait;

use concord_core::{Event, EventId, RoomVersion};

use crate::error::Result;

/// Fetches events the local server does not have.
///
/// Implementations must be thread-safe (Send + Sync). Returned events are
/// parsed for `room_version` but not validated further.
#[async_trait]
pub trait FederationClient: Send + Sync {
    /// Fetch a single event.
    async fn fetch_event(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Event>;

    /// Fetch the auth chain of an event, not including the event itself.
    ///
    /// Events come back in increasing depth.
    async fn fetch_missing_auth_chain(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Vec<Event>>;
}

#[async_trait]
impl<C> FederationClient for Arc<C>
where
    C: FederationClient + ?Sized,
{
    async fn fetch_event(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Event> {
        (**self).fetch_event(event_id, room_version).await
    }

    async fn fetch_missing_auth_chain(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Vec<Event>> {
        (**self).fetch_missing_auth_chain(event_id, room_version).await
    }
}
