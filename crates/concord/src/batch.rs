//! Ordering of event batches before persistence.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::error;

use concord_core::{Event, EventId, EventView};

use crate::error::{HandlerError, Result};

/// Order a batch so every event comes after the batch members it names as
/// auth events.
///
/// Among events that are ready at the same time, shallower events go first,
/// then smaller IDs. A cycle of auth dependencies can only come from a hash
/// collision or a bug, and fails the whole batch with
/// [`HandlerError::AuthCycle`].
pub fn order_batch_by_auth(events: Vec<Event>) -> Result<Vec<Event>> {
    let mut by_id: HashMap<EventId, Event> = events
        .into_iter()
        .map(|e| (e.event_id().clone(), e))
        .collect();

    let mut pending: HashMap<EventId, usize> = HashMap::with_capacity(by_id.len());
    let mut dependents: HashMap<EventId, Vec<EventId>> = HashMap::new();
    let mut ready = BinaryHeap::new();
    for (id, event) in &by_id {
        let mut deps: Vec<&EventId> = event
            .auth_event_ids()
            .iter()
            .filter(|a| by_id.contains_key(*a))
            .collect();
        deps.sort();
        deps.dedup();
        if deps.is_empty() {
            ready.push(Reverse((event.depth(), id.clone())));
        }
        pending.insert(id.clone(), deps.len());
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut ordered = Vec::with_capacity(by_id.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        for dependent in dependents.remove(&id).unwrap_or_default() {
            if let Some(count) = pending.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    if let Some(event) = by_id.get(&dependent) {
                        ready.push(Reverse((event.depth(), dependent.clone())));
                    }
                }
            }
        }
        if let Some(event) = by_id.remove(&id) {
            ordered.push(event);
        }
    }

    if !by_id.is_empty() {
        let mut stuck: Vec<EventId> = by_id.into_keys().collect();
        stuck.sort();
        error!(events = ?stuck, "auth dependency cycle in batch");
        return Err(HandlerError::AuthCycle(stuck));
    }
    Ok(ordered)
}
