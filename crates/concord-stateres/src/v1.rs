//! The original state resolution algorithm.
//!
//! Conflicts are settled in phases: power levels, then join rules, then
//! memberships, then everything else. Within a slot, candidates are ordered
//! by depth and a hash of their ID, and auth is checked against the state
//! resolved so far.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use concord_auth::{auth_types_for_event, check_auth_rules_with_map, AuthEventMap};
use concord_core::{
    event_type, Blake3Hash, EventFields, EventId, EventView, RoomVersion, StateKey, StateMap,
    StoredEvent,
};
use concord_store::EventStore;

use crate::error::Result;
use crate::events::Events;

type Conflicts = BTreeMap<StateKey, BTreeSet<EventId>>;

/// Split the input states into agreed entries and disagreements.
///
/// A slot present in only some of the inputs is not a conflict here.
fn separate(state_sets: &[StateMap]) -> (StateMap, Conflicts) {
    let mut unconflicted = StateMap::new();
    let mut conflicted = Conflicts::new();
    for state in state_sets {
        for (key, event_id) in state {
            if let Some(candidates) = conflicted.get_mut(key) {
                candidates.insert(event_id.clone());
                continue;
            }
            match unconflicted.get(key) {
                None => {
                    unconflicted.insert(key.clone(), event_id.clone());
                }
                Some(existing) if existing == event_id => {}
                Some(_) => {
                    if let Some(existing) = unconflicted.remove(key) {
                        conflicted.insert(key.clone(), BTreeSet::from([existing, event_id.clone()]));
                    }
                }
            }
        }
    }
    (unconflicted, conflicted)
}

/// Deepest first, then by the hash of the event ID.
fn ordered(mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
    events.sort_by_cached_key(|e| (-e.depth(), Blake3Hash::hash(e.event_id().as_str().as_bytes()).0));
    events
}

fn passes<A: EventView>(room_version: &RoomVersion, event: &StoredEvent, auth_events: &AuthEventMap<'_, A>) -> bool {
    match check_auth_rules_with_map(room_version, event, auth_events) {
        Ok(_) => true,
        Err(e) => {
            debug!(event_id = %event.event_id(), reason = %e, "candidate fails auth");
            false
        }
    }
}

fn as_map(events: &BTreeMap<StateKey, StoredEvent>) -> AuthEventMap<'_, StoredEvent> {
    events.iter().map(|(k, e)| (k.clone(), e)).collect()
}

/// Pick the winner among candidates for an auth slot.
///
/// Starting from the shallowest candidate, each is checked against the one
/// before it. The last candidate to pass wins.
fn resolve_auth_events(
    room_version: &RoomVersion,
    candidates: Vec<StoredEvent>,
    auth_events: &BTreeMap<StateKey, StoredEvent>,
) -> Option<StoredEvent> {
    let mut reversed = ordered(candidates);
    reversed.reverse();

    let auth_keys: BTreeSet<StateKey> = reversed
        .iter()
        .filter_map(|e| auth_types_for_event(room_version, e).ok())
        .flatten()
        .collect();
    let mut auth: BTreeMap<StateKey, StoredEvent> = auth_keys
        .into_iter()
        .filter_map(|key| auth_events.get(&key).map(|e| (key, e.clone())))
        .collect();

    let mut iter = reversed.into_iter();
    let mut prev = iter.next()?;
    for event in iter {
        if let Some(slot) = prev.state_slot() {
            auth.insert(slot, prev.clone());
        }
        if !passes(room_version, &event, &as_map(&auth)) {
            return Some(prev);
        }
        prev = event;
    }
    Some(prev)
}

/// Pick the deepest candidate that passes auth, or the shallowest if none do.
fn resolve_normal_events(
    room_version: &RoomVersion,
    candidates: Vec<StoredEvent>,
    auth_events: &BTreeMap<StateKey, StoredEvent>,
) -> Option<StoredEvent> {
    let auth = as_map(auth_events);
    let ordered = ordered(candidates);
    ordered
        .iter()
        .find(|event| passes(room_version, *event, &auth))
        .or_else(|| ordered.last())
        .cloned()
}

pub(crate) async fn resolve<S>(
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    events: &mut Events<'_, S>,
) -> Result<StateMap>
where
    S: EventStore + ?Sized,
{
    let (mut unconflicted, conflicted_ids) = separate(state_sets);
    if conflicted_ids.is_empty() {
        return Ok(unconflicted);
    }

    let mut conflicted: BTreeMap<StateKey, Vec<StoredEvent>> = BTreeMap::new();
    for (key, ids) in &conflicted_ids {
        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            candidates.push(events.require(id).await?);
        }
        conflicted.insert(key.clone(), candidates);
    }

    // Auth events for the candidates, taken from the agreed state.
    let mut auth_events: BTreeMap<StateKey, StoredEvent> = BTreeMap::new();
    for candidate in conflicted.values().flatten() {
        let Ok(types) = auth_types_for_event(room_version, candidate) else {
            continue;
        };
        for key in types {
            if auth_events.contains_key(&key) {
                continue;
            }
            let Some(id) = unconflicted.get(&key) else {
                continue;
            };
            match events.get(id).await? {
                Some(event) => {
                    auth_events.insert(key, event);
                }
                None => warn!(event_id = %id, "auth event for state resolution is missing"),
            }
        }
    }

    let power_key = StateKey::new(event_type::POWER_LEVELS, "");
    let mut resolved: BTreeMap<StateKey, StoredEvent> = BTreeMap::new();

    if let Some(candidates) = conflicted.remove(&power_key) {
        if let Some(winner) = resolve_auth_events(room_version, candidates, &auth_events) {
            resolved.insert(power_key, winner);
        }
    }
    auth_events.extend(resolved.clone());

    for phase in [event_type::JOIN_RULES, event_type::MEMBER] {
        let keys: Vec<StateKey> = conflicted
            .keys()
            .filter(|k| k.event_type == phase)
            .cloned()
            .collect();
        for key in keys {
            if let Some(candidates) = conflicted.remove(&key) {
                if let Some(winner) = resolve_auth_events(room_version, candidates, &auth_events) {
                    resolved.insert(key, winner);
                }
            }
        }
        auth_events.extend(resolved.clone());
    }

    for (key, candidates) in conflicted {
        if let Some(winner) = resolve_normal_events(room_version, candidates, &auth_events) {
            resolved.insert(key, winner);
        }
    }

    for (key, event) in resolved {
        unconflicted.insert(key, event.event_id().clone());
    }
    Ok(unconflicted)
}
