//! Auth chain queries over any [`EventStore`].
//!
//! The chain cover index answers most auth chain difference queries. When
//! it cannot (an event was stored before it was indexed, or never was), the
//! graph is walked through `auth_events` instead.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use concord_core::{EventId, EventView};

use crate::error::Result;
use crate::traits::{EventMap, EventStore};

/// Auth event IDs of an event, preferring `overlay` over the store.
async fn auth_edges<S>(store: &S, overlay: &EventMap, event_id: &EventId) -> Result<Option<Vec<EventId>>>
where
    S: EventStore + ?Sized,
{
    if let Some(event) = overlay.get(event_id) {
        return Ok(Some(event.auth_event_ids().to_vec()));
    }
    Ok(store
        .get_event(event_id)
        .await?
        .map(|event| event.auth_event_ids().to_vec()))
}

/// Every event reachable from `event_ids` through `auth_events`, not
/// counting the starting events themselves.
///
/// Events missing from the store end the walk along that path.
pub async fn get_auth_chain_ids<S>(store: &S, event_ids: &[EventId]) -> Result<BTreeSet<EventId>>
where
    S: EventStore + ?Sized,
{
    let mut chain = BTreeSet::new();
    let mut stack: Vec<EventId> = event_ids.to_vec();
    while let Some(id) = stack.pop() {
        let Some(event) = store.get_event(&id).await? else {
            continue;
        };
        for auth_id in event.auth_event_ids() {
            if chain.insert(auth_id.clone()) {
                stack.push(auth_id.clone());
            }
        }
    }
    Ok(chain)
}

/// Auth chain difference by walking the graph: events in the inclusive
/// auth chain of some state sets but not all of them.
///
/// Events in `overlay` are used in place of stored ones, so events that are
/// not persisted yet can take part.
pub async fn auth_chain_difference_by_walking<S>(
    store: &S,
    overlay: &EventMap,
    state_sets: &[BTreeSet<EventId>],
) -> Result<BTreeSet<EventId>>
where
    S: EventStore + ?Sized,
{
    let mut edges_by_id: HashMap<EventId, Vec<EventId>> = HashMap::new();
    let mut reach: Vec<BTreeSet<EventId>> = Vec::with_capacity(state_sets.len());

    for set in state_sets {
        let mut seen = set.clone();
        let mut stack: Vec<EventId> = set.iter().cloned().collect();
        while let Some(id) = stack.pop() {
            if !edges_by_id.contains_key(&id) {
                let edges = match auth_edges(store, overlay, &id).await? {
                    Some(edges) => edges,
                    None => {
                        debug!(event_id = %id, "auth event not in store");
                        Vec::new()
                    }
                };
                edges_by_id.insert(id.clone(), edges);
            }
            for auth_id in edges_by_id.get(&id).into_iter().flatten() {
                if seen.insert(auth_id.clone()) {
                    stack.push(auth_id.clone());
                }
            }
        }
        reach.push(seen);
    }

    let Some((first, rest)) = reach.split_first() else {
        return Ok(BTreeSet::new());
    };
    let union: BTreeSet<EventId> = reach.iter().flatten().cloned().collect();
    let common: BTreeSet<EventId> = first
        .iter()
        .filter(|id| rest.iter().all(|other| other.contains(*id)))
        .cloned()
        .collect();
    Ok(union.difference(&common).cloned().collect())
}

/// Auth chain difference, from the chain cover index when possible.
pub async fn auth_chain_difference<S>(
    store: &S,
    overlay: &EventMap,
    state_sets: &[BTreeSet<EventId>],
) -> Result<BTreeSet<EventId>>
where
    S: EventStore + ?Sized,
{
    if let Some(difference) = store.get_auth_chain_difference(state_sets).await? {
        return Ok(difference);
    }
    debug!(sets = state_sets.len(), "chain cover incomplete, walking auth events");
    auth_chain_difference_by_walking(store, overlay, state_sets).await
}
