//! Power-aware state resolution.
//!
//! The conflicted set is widened with the auth chain difference of the
//! inputs. Power events are replayed first, ordered by their auth
//! dependencies and their senders' power. Everything else is replayed in
//! mainline order against the resulting power levels. Agreed state is laid
//! over the result last.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use concord_auth::{auth_types_for_event, check_auth_rules_with_map, AuthEventMap};
use concord_core::{
    event_type, EventFields, EventId, EventView, Membership, PowerLevelsContent, RoomVersion,
    StateKey, StateMap, StoredEvent,
};
use concord_store::{auth_chain_difference, EventStore};

use crate::error::Result;
use crate::events::Events;
use crate::sort::lexicographical_topological_sort;

/// Level of the room creator when the event names no power levels.
const CREATOR_LEVEL: i64 = 100;

/// Split the input states. A slot missing from any input is a conflict.
fn separate(state_sets: &[StateMap]) -> (StateMap, BTreeMap<StateKey, BTreeSet<EventId>>) {
    let keys: BTreeSet<&StateKey> = state_sets.iter().flat_map(|s| s.keys()).collect();
    let mut unconflicted = StateMap::new();
    let mut conflicted = BTreeMap::new();
    for key in keys {
        let values: BTreeSet<Option<&EventId>> = state_sets.iter().map(|s| s.get(key)).collect();
        if values.len() == 1 {
            if let Some(Some(id)) = values.into_iter().next() {
                unconflicted.insert(key.clone(), id.clone());
            }
        } else {
            let ids: BTreeSet<EventId> = values.into_iter().flatten().cloned().collect();
            conflicted.insert(key.clone(), ids);
        }
    }
    (unconflicted, conflicted)
}

/// Events that change who may do what: create, power levels, join rules,
/// and kicks or bans of someone else.
pub fn is_power_event<E: EventFields + ?Sized>(event: &E) -> bool {
    match (event.event_type(), event.state_key()) {
        (event_type::POWER_LEVELS | event_type::JOIN_RULES | event_type::CREATE, Some("")) => true,
        (event_type::MEMBER, Some(target)) => {
            matches!(event.membership(), Membership::Leave | Membership::Ban)
                && target != event.sender().as_str()
        }
        _ => false,
    }
}

fn is_power_levels(event: &StoredEvent) -> bool {
    event.event_type() == event_type::POWER_LEVELS && event.state_key() == Some("")
}

/// The power levels event among an event's auth events, if any.
async fn power_levels_auth_event<S>(events: &mut Events<'_, S>, event: &StoredEvent) -> Result<Option<StoredEvent>>
where
    S: EventStore + ?Sized,
{
    for auth_id in event.auth_event_ids() {
        if let Some(auth_event) = events.get(auth_id).await? {
            if is_power_levels(&auth_event) {
                return Ok(Some(auth_event));
            }
        }
    }
    Ok(None)
}

/// The sender's power level as of the event's own auth events.
async fn sender_power_level<S>(events: &mut Events<'_, S>, event: &StoredEvent) -> Result<i64>
where
    S: EventStore + ?Sized,
{
    let sender = event.sender().as_str();
    if let Some(pl) = power_levels_auth_event(events, event).await? {
        return Ok(PowerLevelsContent::new(pl.content()).user_level(sender));
    }
    for auth_id in event.auth_event_ids() {
        if let Some(auth_event) = events.get(auth_id).await? {
            if auth_event.event_type() == event_type::CREATE && auth_event.state_key() == Some("") {
                let creator = auth_event.content().get("creator").and_then(|c| c.as_str());
                return Ok(if creator == Some(sender) { CREATOR_LEVEL } else { 0 });
            }
        }
    }
    Ok(0)
}

/// Order power events so that auth dependencies come first, then higher
/// sender power, then earlier timestamps.
async fn reverse_topological_power_sort<S>(
    events: &mut Events<'_, S>,
    power_events: &[EventId],
    full_conflicted: &BTreeSet<EventId>,
) -> Result<Vec<EventId>>
where
    S: EventStore + ?Sized,
{
    let mut graph: HashMap<EventId, HashSet<EventId>> = HashMap::new();
    for event_id in power_events {
        let mut stack = vec![event_id.clone()];
        while let Some(id) = stack.pop() {
            if graph.contains_key(&id) {
                continue;
            }
            let event = events.require(&id).await?;
            let edges: HashSet<EventId> = event
                .auth_event_ids()
                .iter()
                .filter(|a| full_conflicted.contains(*a))
                .cloned()
                .collect();
            stack.extend(edges.iter().filter(|a| !graph.contains_key(*a)).cloned());
            graph.insert(id, edges);
        }
    }

    let mut order_keys: HashMap<EventId, (Reverse<i64>, i64)> = HashMap::with_capacity(graph.len());
    for id in graph.keys() {
        let event = events.require(id).await?;
        let level = sender_power_level(events, &event).await?;
        order_keys.insert(id.clone(), (Reverse(level), event.origin_server_ts()));
    }

    Ok(lexicographical_topological_sort(&graph, |id| {
        let (level, ts) = order_keys.get(id).copied().unwrap_or((Reverse(0), 0));
        (level, ts, id.clone())
    }))
}

/// Replay events in order on top of `base`, keeping each one that passes
/// auth against its own auth events overlaid with the state so far.
async fn iterative_auth_checks<S>(
    room_version: &RoomVersion,
    ordered: &[EventId],
    base: StateMap,
    events: &mut Events<'_, S>,
) -> Result<StateMap>
where
    S: EventStore + ?Sized,
{
    let mut resolved = base;
    for event_id in ordered {
        let event = events.require(event_id).await?;

        let mut auth: BTreeMap<StateKey, StoredEvent> = BTreeMap::new();
        for auth_id in event.auth_event_ids() {
            match events.get(auth_id).await? {
                Some(auth_event) if !auth_event.is_rejected() => {
                    if let Some(slot) = auth_event.state_slot() {
                        auth.insert(slot, auth_event);
                    }
                }
                Some(_) => {}
                None => warn!(auth_event = %auth_id, event_id = %event_id, "auth event is missing"),
            }
        }

        let types = match auth_types_for_event(room_version, &event) {
            Ok(types) => types,
            Err(e) => {
                debug!(event_id = %event_id, reason = %e, "cannot select auth events");
                continue;
            }
        };
        for key in types {
            if let Some(state_id) = resolved.get(&key) {
                let state_event = events.require(state_id).await?;
                if !state_event.is_rejected() {
                    auth.insert(key, state_event);
                }
            }
        }

        if event.is_rejected() {
            continue;
        }

        let auth_map: AuthEventMap<'_, StoredEvent> = auth.iter().map(|(k, e)| (k.clone(), e)).collect();
        match check_auth_rules_with_map(room_version, &event, &auth_map) {
            Ok(_) => {
                if let Some(slot) = event.state_slot() {
                    resolved.insert(slot, event_id.clone());
                }
            }
            Err(e) => debug!(event_id = %event_id, reason = %e, "event fails auth during resolution"),
        }
    }
    Ok(resolved)
}

/// Order events by their position relative to the chain of power levels
/// events ending at `power_levels`, then by timestamp.
async fn mainline_sort<S>(
    events: &mut Events<'_, S>,
    unsorted: Vec<EventId>,
    power_levels: Option<&EventId>,
) -> Result<Vec<EventId>>
where
    S: EventStore + ?Sized,
{
    if unsorted.is_empty() {
        return Ok(unsorted);
    }

    let mut mainline = Vec::new();
    let mut next = power_levels.cloned();
    while let Some(id) = next {
        let event = events.require(&id).await?;
        mainline.push(id);
        next = power_levels_auth_event(events, &event)
            .await?
            .map(|pl| pl.event_id().clone());
    }
    let mainline_depth: HashMap<EventId, i64> = mainline
        .into_iter()
        .rev()
        .enumerate()
        .map(|(i, id)| (id, i as i64 + 1))
        .collect();

    let mut keyed = Vec::with_capacity(unsorted.len());
    for id in unsorted {
        let event = events.require(&id).await?;
        let mut depth = 0;
        let mut cursor = Some(event.clone());
        while let Some(current) = cursor {
            if let Some(d) = mainline_depth.get(current.event_id()) {
                depth = *d;
                break;
            }
            cursor = power_levels_auth_event(events, &current).await?;
        }
        keyed.push(((depth, event.origin_server_ts(), id.clone()), id));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, id)| id).collect())
}

pub(crate) async fn resolve<S>(
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    events: &mut Events<'_, S>,
) -> Result<StateMap>
where
    S: EventStore + ?Sized,
{
    let (unconflicted, conflicted) = separate(state_sets);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    let id_sets: Vec<BTreeSet<EventId>> = state_sets
        .iter()
        .map(|s| s.values().cloned().collect())
        .collect();
    let auth_diff = auth_chain_difference(events.store(), events.supplied(), &id_sets).await?;

    let mut full_conflicted: BTreeSet<EventId> = conflicted.values().flatten().cloned().collect();
    full_conflicted.extend(auth_diff);

    let mut power_events = Vec::new();
    for id in &full_conflicted {
        let event = events.require(id).await?;
        if is_power_event(&event) {
            power_events.push(id.clone());
        }
    }

    let sorted_power = reverse_topological_power_sort(events, &power_events, &full_conflicted).await?;
    debug!(power_events = sorted_power.len(), "replaying power events");
    let mut resolved = iterative_auth_checks(room_version, &sorted_power, unconflicted.clone(), events).await?;

    let power_set: HashSet<&EventId> = sorted_power.iter().collect();
    let leftover: Vec<EventId> = full_conflicted
        .iter()
        .filter(|id| !power_set.contains(id))
        .cloned()
        .collect();
    let power_levels = resolved.get(&StateKey::new(event_type::POWER_LEVELS, "")).cloned();
    let leftover = mainline_sort(events, leftover, power_levels.as_ref()).await?;
    debug!(events = leftover.len(), "replaying remaining events");
    resolved = iterative_auth_checks(room_version, &leftover, resolved, events).await?;

    info!(
        conflicted_slots = conflicted.len(),
        full_conflicted = full_conflicted.len(),
        power_events = sorted_power.len(),
        "resolved state"
    );

    resolved.extend(unconflicted);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::RoomVersion;
    use concord_testkit::fixtures::{TestRoom, ALICE, BOB};

    fn id(n: &str) -> EventId {
        EventId::parse(format!("${n}")).unwrap()
    }

    fn key(t: &str) -> StateKey {
        StateKey::new(t, "")
    }

    #[test]
    fn test_separate_missing_key_is_conflict() {
        let a = StateMap::from([(key("a"), id("1")), (key("b"), id("2"))]);
        let b = StateMap::from([(key("a"), id("1"))]);
        let (unconflicted, conflicted) = separate(&[a, b]);
        assert_eq!(unconflicted, StateMap::from([(key("a"), id("1"))]));
        assert_eq!(conflicted[&key("b")], BTreeSet::from([id("2")]));
    }

    #[test]
    fn test_power_events() {
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.join(BOB);
        assert!(is_power_event(room.create_event()));
        assert!(is_power_event(room.state_event(event_type::POWER_LEVELS, "")));
        assert!(is_power_event(room.state_event(event_type::JOIN_RULES, "")));
        assert!(!is_power_event(room.state_event(event_type::MEMBER, BOB)));

        let kick = room.event(ALICE, event_type::MEMBER, Some(BOB), serde_json::json!({"membership": "leave"}));
        assert!(is_power_event(&kick));
        let leave = room.event(BOB, event_type::MEMBER, Some(BOB), serde_json::json!({"membership": "leave"}));
        assert!(!is_power_event(&leave));
        let name = room.event(ALICE, event_type::NAME, Some(""), serde_json::json!({"name": "x"}));
        assert!(!is_power_event(&name));
    }
}
