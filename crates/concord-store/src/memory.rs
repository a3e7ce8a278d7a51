//! In-memory implementation of the EventStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use concord_core::{
    Event, EventFields, EventId, EventMetadata, EventView, RoomId, RoomVersion, StateDelta,
    StateMap, StoredEvent,
};

use crate::chain::{ChainIndex, ChainPosition};
use crate::error::{Result, StoreError};
use crate::state_group::{build_state_group, resolve_state_group, StateGroup};
use crate::traits::{EventStore, InsertResult};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Events and their metadata, indexed by ID.
    events: HashMap<EventId, StoredEvent>,

    /// Event IDs per room, for purging.
    room_events: HashMap<RoomId, BTreeSet<EventId>>,

    /// Last assigned stream ordering.
    stream_ordering: i64,

    room_versions: HashMap<RoomId, &'static RoomVersion>,

    /// State after each non-outlier event.
    state_groups: HashMap<EventId, StateGroup>,

    current_state: HashMap<RoomId, StateMap>,

    forward_extremities: HashMap<RoomId, BTreeSet<EventId>>,

    chains: ChainIndex,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event, metadata: &EventMetadata) -> Result<InsertResult> {
        let mut inner = self.write()?;

        if inner.events.contains_key(event.event_id()) {
            return Ok(InsertResult::AlreadyExists);
        }

        let mut metadata = metadata.clone();
        if metadata.stream_ordering.is_none() {
            inner.stream_ordering += 1;
            metadata.stream_ordering = Some(inner.stream_ordering);
        }

        inner
            .room_events
            .entry(event.room_id().clone())
            .or_default()
            .insert(event.event_id().clone());
        inner.events.insert(
            event.event_id().clone(),
            StoredEvent::new(Arc::new(event.clone()), metadata),
        );

        Ok(InsertResult::Inserted)
    }

    async fn get_event(&self, event_id: &EventId) -> Result<Option<StoredEvent>> {
        let inner = self.read()?;
        Ok(inner.events.get(event_id).cloned())
    }

    async fn has_event(&self, event_id: &EventId) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner.events.contains_key(event_id))
    }

    async fn get_metadata(&self, event_id: &EventId) -> Result<Option<EventMetadata>> {
        let inner = self.read()?;
        Ok(inner.events.get(event_id).map(|e| e.metadata.clone()))
    }

    async fn update_metadata(&self, event_id: &EventId, metadata: &EventMetadata) -> Result<()> {
        let mut inner = self.write()?;
        let stored = inner
            .events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let stream_ordering = metadata.stream_ordering.or(stored.metadata.stream_ordering);
        stored.metadata = EventMetadata {
            stream_ordering,
            ..metadata.clone()
        };
        Ok(())
    }

    async fn store_room_version(&self, room_id: &RoomId, version: &RoomVersion) -> Result<()> {
        let rules = concord_core::require_room_version(version.identifier)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let mut inner = self.write()?;
        inner.room_versions.insert(room_id.clone(), rules);
        Ok(())
    }

    async fn get_room_version(&self, room_id: &RoomId) -> Result<Option<&'static RoomVersion>> {
        let inner = self.read()?;
        Ok(inner.room_versions.get(room_id).copied())
    }

    async fn purge_room(&self, room_id: &RoomId) -> Result<()> {
        let mut inner = self.write()?;
        let event_ids = inner.room_events.remove(room_id).unwrap_or_default();
        for id in &event_ids {
            inner.events.remove(id);
        }
        inner.chains.remove_events(&event_ids);
        inner.state_groups.retain(|_, group| &group.room_id != room_id);
        inner.room_versions.remove(room_id);
        inner.current_state.remove(room_id);
        inner.forward_extremities.remove(room_id);
        Ok(())
    }

    async fn get_state_at(&self, event_id: &EventId) -> Result<Option<StateMap>> {
        let inner = self.read()?;
        resolve_state_group(event_id, |id| Ok(inner.state_groups.get(id).cloned()))
    }

    async fn store_state_delta(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        prev: Option<&EventId>,
        delta: &StateDelta,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let group = build_state_group(room_id, prev, delta, |id| Ok(inner.state_groups.get(id).cloned()))?;
        inner.state_groups.insert(event_id.clone(), group);
        Ok(())
    }

    async fn get_current_state(&self, room_id: &RoomId) -> Result<StateMap> {
        let inner = self.read()?;
        Ok(inner.current_state.get(room_id).cloned().unwrap_or_default())
    }

    async fn apply_current_state_delta(&self, room_id: &RoomId, delta: &StateDelta) -> Result<()> {
        let mut inner = self.write()?;
        delta.apply(inner.current_state.entry(room_id.clone()).or_default());
        Ok(())
    }

    async fn get_forward_extremities(&self, room_id: &RoomId) -> Result<BTreeSet<EventId>> {
        let inner = self.read()?;
        Ok(inner.forward_extremities.get(room_id).cloned().unwrap_or_default())
    }

    async fn set_forward_extremities(&self, room_id: &RoomId, extremities: &BTreeSet<EventId>) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .forward_extremities
            .insert(room_id.clone(), extremities.clone());
        Ok(())
    }

    async fn allocate_chain(&self, event: &Event) -> Result<ChainPosition> {
        let slot = event
            .state_slot()
            .ok_or_else(|| StoreError::InvalidData(format!("{} is not a state event", event.event_id())))?;
        let mut inner = self.write()?;
        let (position, _) = inner
            .chains
            .allocate(event.event_id(), slot, event.auth_event_ids());
        Ok(position)
    }

    async fn get_chain_position(&self, event_id: &EventId) -> Result<Option<ChainPosition>> {
        let inner = self.read()?;
        Ok(inner.chains.position(event_id))
    }

    async fn get_auth_chain_difference(&self, state_sets: &[BTreeSet<EventId>]) -> Result<Option<BTreeSet<EventId>>> {
        let inner = self.read()?;
        Ok(inner.chains.auth_chain_difference(state_sets))
    }
}
