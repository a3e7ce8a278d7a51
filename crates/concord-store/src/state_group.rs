//! State groups: the state after an event, stored as a chain of deltas.
//!
//! A group points at the group of one predecessor and records only what
//! changed. Once a chain reaches [`MAX_DELTA_HOPS`] the next group is written
//! as a full snapshot so lookups stay bounded.

use concord_core::{EventId, RoomId, StateDelta, StateMap};

use crate::error::{Result, StoreError};

/// Longest delta chain before a full snapshot is written.
pub const MAX_DELTA_HOPS: u32 = 100;

/// The stored state after one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateGroup {
    pub room_id: RoomId,
    /// The event whose state this delta applies to. `None` for snapshots.
    pub prev: Option<EventId>,
    pub delta: StateDelta,
    /// Number of deltas between this group and the nearest snapshot.
    pub hops: u32,
}

impl StateGroup {
    pub fn snapshot(room_id: RoomId, state: StateMap) -> Self {
        Self {
            room_id,
            prev: None,
            delta: StateDelta {
                to_insert: state,
                to_delete: Default::default(),
            },
            hops: 0,
        }
    }
}

/// Resolve the full state after `event_id` by walking its group chain.
///
/// `Ok(None)` when `event_id` has no group; a broken chain further back is
/// an error.
pub fn resolve_state_group<F>(event_id: &EventId, mut lookup: F) -> Result<Option<StateMap>>
where
    F: FnMut(&EventId) -> Result<Option<StateGroup>>,
{
    let mut deltas = Vec::new();
    let mut next = Some(event_id.clone());
    while let Some(id) = next {
        match lookup(&id)? {
            Some(group) => {
                next = group.prev;
                deltas.push(group.delta);
            }
            None if deltas.is_empty() => return Ok(None),
            None => {
                return Err(StoreError::NotFound(format!(
                    "state group for {id} (referenced from {event_id})"
                )))
            }
        }
    }

    let mut state = StateMap::new();
    for delta in deltas.iter().rev() {
        delta.apply(&mut state);
    }
    Ok(Some(state))
}

/// Build the group to store for `delta` applied on top of the state after
/// `prev`.
pub fn build_state_group<F>(
    room_id: &RoomId,
    prev: Option<&EventId>,
    delta: &StateDelta,
    mut lookup: F,
) -> Result<StateGroup>
where
    F: FnMut(&EventId) -> Result<Option<StateGroup>>,
{
    let Some(prev) = prev else {
        let mut state = StateMap::new();
        delta.apply(&mut state);
        return Ok(StateGroup::snapshot(room_id.clone(), state));
    };

    let prev_group = lookup(prev)?
        .ok_or_else(|| StoreError::NotFound(format!("state group for {prev}")))?;
    if prev_group.hops + 1 < MAX_DELTA_HOPS {
        return Ok(StateGroup {
            room_id: room_id.clone(),
            prev: Some(prev.clone()),
            delta: delta.clone(),
            hops: prev_group.hops + 1,
        });
    }

    let mut state = resolve_state_group(prev, &mut lookup)?
        .ok_or_else(|| StoreError::NotFound(format!("state group for {prev}")))?;
    delta.apply(&mut state);
    Ok(StateGroup::snapshot(room_id.clone(), state))
}
