//! # Concord State Resolution
//!
//! Merges divergent views of a room's state into one.
//!
//! ## Overview
//!
//! When the DAG forks, each branch carries its own state. [`resolve_state`]
//! takes the state maps of the branches and returns the single state map
//! every server computes from the same inputs. The algorithm is fixed by
//! the room version:
//!
//! - **v1**: conflicts settled by depth and event ID hash, with auth checks
//!   in a fixed phase order
//! - **v2**: power events replayed first in auth and power order, then the
//!   rest in mainline order
//!
//! ## Failure
//!
//! Resolution never falls back to one of the inputs. If an event needed for
//! the comparison cannot be found, the whole resolution fails with
//! [`StateResError::MissingEvent`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let state = resolve_state(&room_id, room_version, &[left, right], &event_map, &store).await?;
//! ```

pub mod error;
mod events;
pub mod sort;
pub mod v1;
pub mod v2;

use tracing::{debug, instrument};

use concord_core::{RoomId, RoomVersion, StateMap, StateResolutionVersion};
use concord_store::{EventMap, EventStore};

pub use error::{Result, StateResError};
pub use sort::lexicographical_topological_sort;
pub use v2::is_power_event;

use crate::events::Events;

/// Resolve several state maps of one room into one.
///
/// `event_map` holds events the caller already has, which may not be in
/// `store` yet. Anything else is read from `store`.
///
/// The result does not depend on the order of `state_sets`, and resolving a
/// map against copies of itself returns it unchanged.
#[instrument(skip_all, fields(room = %room_id, version = room_version.identifier, sets = state_sets.len()))]
pub async fn resolve_state<S>(
    room_id: &RoomId,
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    event_map: &EventMap,
    store: &S,
) -> Result<StateMap>
where
    S: EventStore + ?Sized,
{
    match state_sets {
        [] => return Ok(StateMap::new()),
        [single] => return Ok(single.clone()),
        _ => {}
    }

    let mut events = Events::new(room_id, event_map, store);
    let resolved = match room_version.state_res {
        StateResolutionVersion::V1 => v1::resolve(room_version, state_sets, &mut events).await?,
        StateResolutionVersion::V2 => v2::resolve(room_version, state_sets, &mut events).await?,
    };
    debug!(entries = resolved.len(), "state resolution finished");
    Ok(resolved)
}
