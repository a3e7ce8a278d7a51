//! Deterministic orderings of events.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::warn;

use concord_core::EventId;

/// Topologically sort `graph`, breaking ties by `key`.
///
/// `graph` maps each event to the events it depends on (its auth events
/// within the graph). Dependencies come out first. Among events whose
/// dependencies are all out, the one with the smallest key goes next.
///
/// Events on a cycle are never emitted.
pub fn lexicographical_topological_sort<K, F>(graph: &HashMap<EventId, HashSet<EventId>>, key: F) -> Vec<EventId>
where
    K: Ord,
    F: Fn(&EventId) -> K,
{
    let mut outdegree: HashMap<&EventId, usize> = HashMap::with_capacity(graph.len());
    let mut dependents: HashMap<&EventId, Vec<&EventId>> = HashMap::with_capacity(graph.len());
    let mut ready = BinaryHeap::new();

    for (node, edges) in graph {
        let edges: Vec<&EventId> = edges.iter().filter(|e| graph.contains_key(*e)).collect();
        if edges.is_empty() {
            ready.push(Reverse((key(node), node)));
        }
        outdegree.insert(node, edges.len());
        for edge in edges {
            dependents.entry(edge).or_default().push(node);
        }
    }

    let mut sorted = Vec::with_capacity(graph.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        sorted.push(node.clone());
        for &parent in dependents.get(node).into_iter().flatten() {
            if let Some(degree) = outdegree.get_mut(parent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((key(parent), parent)));
                }
            }
        }
    }

    if sorted.len() != graph.len() {
        warn!(
            sorted = sorted.len(),
            total = graph.len(),
            "auth graph has a cycle, dropping the events on it"
        );
    }
    sorted
}
