//! Event lookup for a single resolution.

use std::collections::HashMap;

use concord_core::{EventFields, EventId, RoomId, StoredEvent};
use concord_store::{EventMap, EventStore};

use crate::error::{Result, StateResError};

/// Events supplied by the caller, backed by the store.
///
/// Every event handed out is checked to be in the room being resolved.
/// Store hits are kept for the rest of the resolution.
pub(crate) struct Events<'a, S: ?Sized> {
    room_id: &'a RoomId,
    supplied: &'a EventMap,
    store: &'a S,
    loaded: HashMap<EventId, Option<StoredEvent>>,
}

impl<'a, S> Events<'a, S>
where
    S: EventStore + ?Sized,
{
    pub(crate) fn new(room_id: &'a RoomId, supplied: &'a EventMap, store: &'a S) -> Self {
        Self {
            room_id,
            supplied,
            store,
            loaded: HashMap::new(),
        }
    }

    pub(crate) fn store(&self) -> &'a S {
        self.store
    }

    pub(crate) fn supplied(&self) -> &'a EventMap {
        self.supplied
    }

    /// The event, or `None` if nobody has it.
    pub(crate) async fn get(&mut self, event_id: &EventId) -> Result<Option<StoredEvent>> {
        let event = match self.supplied.get(event_id) {
            Some(event) => Some(event.clone()),
            None => match self.loaded.get(event_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.store.get_event(event_id).await?;
                    self.loaded.insert(event_id.clone(), fetched.clone());
                    fetched
                }
            },
        };
        if let Some(event) = &event {
            if event.room_id() != self.room_id {
                return Err(StateResError::CrossRoomEvent {
                    event_id: event_id.clone(),
                    expected: self.room_id.clone(),
                    found: event.room_id().clone(),
                });
            }
        }
        Ok(event)
    }

    /// The event, failing the resolution if nobody has it.
    pub(crate) async fn require(&mut self, event_id: &EventId) -> Result<StoredEvent> {
        self.get(event_id)
            .await?
            .ok_or_else(|| StateResError::MissingEvent(event_id.clone()))
    }
}
