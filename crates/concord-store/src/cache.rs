//! An LRU cache of events in front of a store.
//!
//! The cache holds [`StoredEvent`]s, metadata included, so every write path
//! that changes metadata or removes events must invalidate it. Those hooks are
//! called by [`CachedStore`]; callers holding an [`EventCache`] directly call
//! them themselves.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lru::LruCache;
use tracing::trace;

use concord_core::{
    Event, EventFields, EventId, EventMetadata, EventView, RoomId, RoomVersion, StateDelta, StateMap,
    StoredEvent,
};

use crate::chain::ChainPosition;
use crate::error::Result;
use crate::traits::{EventStore, InsertResult};

/// Default number of cached events.
pub const DEFAULT_EVENT_CACHE_CAPACITY: usize = 10_000;

/// A bounded, least-recently-used event cache.
pub struct EventCache {
    inner: Mutex<LruCache<EventId, StoredEvent>>,
}

impl EventCache {
    /// A cache holding at most `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    // Entries are whole values, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, LruCache<EventId, StoredEvent>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, event_id: &EventId) -> Option<StoredEvent> {
        self.lock().get(event_id).cloned()
    }

    pub fn insert(&self, event: StoredEvent) {
        let id = event.event.event_id().clone();
        self.lock().put(id, event);
    }

    /// Drop one event.
    pub fn invalidate(&self, event_id: &EventId) {
        if self.lock().pop(event_id).is_some() {
            trace!(event_id = %event_id, "invalidated cached event");
        }
    }

    /// Drop every event belonging to a room.
    pub fn invalidate_room(&self, room_id: &RoomId) {
        let mut cache = self.lock();
        let stale: Vec<EventId> = cache
            .iter()
            .filter(|(_, stored)| stored.event.room_id() == room_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            cache.pop(id);
        }
        trace!(room_id = %room_id, count = stale.len(), "invalidated cached room");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CACHE_CAPACITY)
    }
}

/// A store wrapper that serves event reads from an [`EventCache`].
pub struct CachedStore<S> {
    store: S,
    cache: EventCache,
}

impl<S: EventStore> CachedStore<S> {
    pub fn new(store: S, capacity: usize) -> Self {
        Self {
            store,
            cache: EventCache::new(capacity),
        }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }
}

#[async_trait]
impl<S: EventStore> EventStore for CachedStore<S> {
    async fn insert_event(&self, event: &Event, metadata: &EventMetadata) -> Result<InsertResult> {
        self.store.insert_event(event, metadata).await
    }

    async fn get_event(&self, event_id: &EventId) -> Result<Option<StoredEvent>> {
        if let Some(stored) = self.cache.get(event_id) {
            return Ok(Some(stored));
        }
        let stored = self.store.get_event(event_id).await?;
        if let Some(stored) = &stored {
            self.cache.insert(stored.clone());
        }
        Ok(stored)
    }

    async fn has_event(&self, event_id: &EventId) -> Result<bool> {
        if self.cache.get(event_id).is_some() {
            return Ok(true);
        }
        self.store.has_event(event_id).await
    }

    async fn get_metadata(&self, event_id: &EventId) -> Result<Option<EventMetadata>> {
        if let Some(stored) = self.cache.get(event_id) {
            return Ok(Some(stored.metadata));
        }
        self.store.get_metadata(event_id).await
    }

    // Invalidated again after the write: a read while the write is pending
    // can cache the old row.
    async fn update_metadata(&self, event_id: &EventId, metadata: &EventMetadata) -> Result<()> {
        self.cache.invalidate(event_id);
        self.store.update_metadata(event_id, metadata).await?;
        self.cache.invalidate(event_id);
        Ok(())
    }

    async fn store_room_version(&self, room_id: &RoomId, version: &RoomVersion) -> Result<()> {
        self.store.store_room_version(room_id, version).await
    }

    async fn get_room_version(&self, room_id: &RoomId) -> Result<Option<&'static RoomVersion>> {
        self.store.get_room_version(room_id).await
    }

    async fn purge_room(&self, room_id: &RoomId) -> Result<()> {
        self.cache.invalidate_room(room_id);
        self.store.purge_room(room_id).await?;
        self.cache.invalidate_room(room_id);
        Ok(())
    }

    async fn get_state_at(&self, event_id: &EventId) -> Result<Option<StateMap>> {
        self.store.get_state_at(event_id).await
    }

    async fn store_state_delta(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        prev: Option<&EventId>,
        delta: &StateDelta,
    ) -> Result<()> {
        self.store.store_state_delta(room_id, event_id, prev, delta).await
    }

    async fn get_current_state(&self, room_id: &RoomId) -> Result<StateMap> {
        self.store.get_current_state(room_id).await
    }

    async fn apply_current_state_delta(&self, room_id: &RoomId, delta: &StateDelta) -> Result<()> {
        self.store.apply_current_state_delta(room_id, delta).await
    }

    async fn get_forward_extremities(&self, room_id: &RoomId) -> Result<BTreeSet<EventId>> {
        self.store.get_forward_extremities(room_id).await
    }

    async fn set_forward_extremities(&self, room_id: &RoomId, extremities: &BTreeSet<EventId>) -> Result<()> {
        self.store.set_forward_extremities(room_id, extremities).await
    }

    async fn allocate_chain(&self, event: &Event) -> Result<ChainPosition> {
        self.store.allocate_chain(event).await
    }

    async fn get_chain_position(&self, event_id: &EventId) -> Result<Option<ChainPosition>> {
        self.store.get_chain_position(event_id).await
    }

    async fn get_auth_chain_difference(&self, state_sets: &[BTreeSet<EventId>]) -> Result<Option<BTreeSet<EventId>>> {
        self.store.get_auth_chain_difference(state_sets).await
    }
}
