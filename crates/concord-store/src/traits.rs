//! EventStore trait: the abstract interface for event persistence.
//!
//! The handler and the state resolver only ever talk to this trait.
//! Implementations include SQLite (primary) and in-memory (for tests).

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use concord_core::{
    Event, EventId, EventMetadata, RoomId, RoomVersion, StateDelta, StateMap, StoredEvent,
};

use crate::chain::ChainPosition;
use crate::error::Result;

/// Events keyed by ID, for callers holding events the store may not have.
pub type EventMap = HashMap<EventId, StoredEvent>;

/// Result of inserting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Event was inserted.
    Inserted,
    /// Event already exists (idempotent - not an error). Its metadata is
    /// left untouched.
    AlreadyExists,
}

/// The EventStore trait: async interface for events, state and the auth
/// chain index.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Immutable events**: an event is written once. Only its
///   [`EventMetadata`] changes afterwards.
/// - **State as deltas**: the state after an event is stored as a delta
///   against the state after one of its predecessors.
/// - **Chain cover**: state events get a [`ChainPosition`] when persisted, so
///   auth chain differences can be computed without walking the graph.
#[async_trait]
pub trait EventStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Event Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert an event together with its metadata.
    ///
    /// A stream ordering is assigned when the metadata has none.
    async fn insert_event(&self, event: &Event, metadata: &EventMetadata) -> Result<InsertResult>;

    /// Get an event and its metadata.
    async fn get_event(&self, event_id: &EventId) -> Result<Option<StoredEvent>>;

    /// Get several events. Unknown IDs are skipped.
    async fn get_events(&self, event_ids: &[EventId]) -> Result<Vec<StoredEvent>> {
        let mut events = Vec::with_capacity(event_ids.len());
        for id in event_ids {
            if let Some(event) = self.get_event(id).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Check if an event exists.
    async fn has_event(&self, event_id: &EventId) -> Result<bool>;

    /// Get an event's metadata.
    async fn get_metadata(&self, event_id: &EventId) -> Result<Option<EventMetadata>>;

    /// Replace an event's metadata. Fails with `NotFound` for unknown events.
    async fn update_metadata(&self, event_id: &EventId, metadata: &EventMetadata) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Room Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the version of a room, taken from its create event.
    async fn store_room_version(&self, room_id: &RoomId, version: &RoomVersion) -> Result<()>;

    /// The version of a room, if known.
    async fn get_room_version(&self, room_id: &RoomId) -> Result<Option<&'static RoomVersion>>;

    /// Delete everything stored for a room.
    async fn purge_room(&self, room_id: &RoomId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // State Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// The state after an event, or `None` if none was stored for it
    /// (outliers have no state).
    async fn get_state_at(&self, event_id: &EventId) -> Result<Option<StateMap>>;

    /// Store the state after `event_id` as a delta against the state after
    /// `prev`, or as a full state when `prev` is `None`.
    async fn store_state_delta(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        prev: Option<&EventId>,
        delta: &StateDelta,
    ) -> Result<()>;

    /// The room's current state.
    async fn get_current_state(&self, room_id: &RoomId) -> Result<StateMap>;

    /// Apply a delta to the room's current state.
    async fn apply_current_state_delta(&self, room_id: &RoomId, delta: &StateDelta) -> Result<()>;

    /// Events in the room with no known successors.
    async fn get_forward_extremities(&self, room_id: &RoomId) -> Result<BTreeSet<EventId>>;

    /// Replace the room's forward extremities.
    async fn set_forward_extremities(&self, room_id: &RoomId, extremities: &BTreeSet<EventId>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Chain Cover Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Place a persisted state event on the chain cover index.
    ///
    /// Idempotent: an already indexed event keeps its position.
    async fn allocate_chain(&self, event: &Event) -> Result<ChainPosition>;

    /// The chain position of an event, if indexed.
    async fn get_chain_position(&self, event_id: &EventId) -> Result<Option<ChainPosition>>;

    /// The auth chain difference computed from the chain cover index, or
    /// `None` when an event involved has no chain position.
    async fn get_auth_chain_difference(&self, state_sets: &[BTreeSet<EventId>]) -> Result<Option<BTreeSet<EventId>>>;
}
