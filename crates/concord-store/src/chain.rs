//! The chain cover index over the auth DAG.
//!
//! Every state event is placed on a *chain*: a run of events for the same
//! `(type, state_key)` slot where each one is authorized by the one before.
//! Reachability between chains is stored as links from a position on one
//! chain to a position on another. The auth chain of any event can then be
//! described by a maximum sequence number per chain, which makes the auth
//! chain difference a range computation instead of a graph walk.
//!
//! Links are only ever added from an event to positions it can reach, and a
//! link that is implied by an existing one is never stored.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use concord_core::{EventId, StateKey};

/// A position on a chain. Sequence numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainPosition {
    pub chain_id: i64,
    pub sequence_number: i64,
}

impl ChainPosition {
    pub fn new(chain_id: i64, sequence_number: i64) -> Self {
        Self {
            chain_id,
            sequence_number,
        }
    }
}

/// A link from a position on one chain to a position on another.
///
/// Everything at or below `origin` can reach everything at or below `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainLink {
    pub origin: ChainPosition,
    pub target: ChainPosition,
}

/// The set of links between chains.
#[derive(Debug, Clone, Default)]
pub struct LinkMap {
    /// origin chain → target chain → origin sequence → target sequence
    maps: BTreeMap<i64, BTreeMap<i64, BTreeMap<i64, i64>>>,
    /// Links added since the last [`LinkMap::take_additions`], keyed by
    /// origin and target chain.
    additions: BTreeSet<(ChainPosition, i64)>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link, returning `false` when an existing link already implies it.
    ///
    /// A link crossing an existing one (starting at or after it and ending at
    /// or before it) adds nothing. Links within one chain are implicit.
    pub fn add_link(&mut self, origin: ChainPosition, target: ChainPosition) -> bool {
        if origin.chain_id == target.chain_id {
            return false;
        }
        let current = self
            .maps
            .entry(origin.chain_id)
            .or_default()
            .entry(target.chain_id)
            .or_default();

        let redundant = current.iter().any(|(&current_origin, &current_target)| {
            current_origin <= origin.sequence_number && target.sequence_number <= current_target
        });
        if redundant {
            return false;
        }

        current.insert(origin.sequence_number, target.sequence_number);
        self.additions.insert((origin, target.chain_id));
        true
    }

    /// Load a persisted link. No redundancy check, not recorded as an addition.
    pub fn restore_link(&mut self, link: ChainLink) {
        self.maps
            .entry(link.origin.chain_id)
            .or_default()
            .entry(link.target.chain_id)
            .or_default()
            .insert(link.origin.sequence_number, link.target.sequence_number);
    }

    /// Targets of every link leaving `origin`'s chain at or below `origin`.
    pub fn get_links_from(&self, origin: ChainPosition) -> impl Iterator<Item = ChainPosition> + '_ {
        self.maps
            .get(&origin.chain_id)
            .into_iter()
            .flat_map(|targets| targets.iter())
            .flat_map(move |(&target_chain, links)| {
                links
                    .iter()
                    .filter(move |&(&origin_seq, _)| origin_seq <= origin.sequence_number)
                    .map(move |(_, &target_seq)| ChainPosition::new(target_chain, target_seq))
            })
    }

    /// `(origin sequence, target sequence)` pairs for links between two chains.
    pub fn get_links_between(&self, origin_chain: i64, target_chain: i64) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.maps
            .get(&origin_chain)
            .and_then(|targets| targets.get(&target_chain))
            .into_iter()
            .flat_map(|links| links.iter().map(|(&o, &t)| (o, t)))
    }

    /// Links added since the last call to [`LinkMap::take_additions`].
    pub fn get_additions(&self) -> impl Iterator<Item = ChainLink> + '_ {
        self.additions.iter().filter_map(|&(origin, target_chain)| {
            let target_seq = self
                .maps
                .get(&origin.chain_id)?
                .get(&target_chain)?
                .get(&origin.sequence_number)?;
            Some(ChainLink {
                origin,
                target: ChainPosition::new(target_chain, *target_seq),
            })
        })
    }

    /// Drain the pending additions, for persistence.
    pub fn take_additions(&mut self) -> Vec<ChainLink> {
        let links = self.get_additions().collect();
        self.additions.clear();
        links
    }

    /// Whether `target` is reachable from `origin` through a single link or
    /// by being lower on the same chain.
    pub fn exists_path_from(&self, origin: ChainPosition, target: ChainPosition) -> bool {
        if origin.chain_id == target.chain_id {
            return target.sequence_number <= origin.sequence_number;
        }
        self.get_links_between(origin.chain_id, target.chain_id)
            .any(|(link_origin, link_target)| {
                link_origin <= origin.sequence_number && target.sequence_number <= link_target
            })
    }

    /// Drop every link that starts or ends on one of `chains`.
    pub fn remove_chains(&mut self, chains: &BTreeSet<i64>) {
        self.maps.retain(|origin, targets| {
            targets.retain(|target, _| !chains.contains(target));
            !chains.contains(origin) && !targets.is_empty()
        });
        self.additions
            .retain(|(origin, target)| !chains.contains(&origin.chain_id) && !chains.contains(target));
    }

    pub fn len(&self) -> usize {
        self.maps
            .values()
            .flat_map(|targets| targets.values())
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chain positions for every indexed state event, plus the links.
#[derive(Debug, Clone, Default)]
pub struct ChainIndex {
    positions: HashMap<EventId, ChainPosition>,
    slots: HashMap<EventId, StateKey>,
    chains: BTreeMap<i64, BTreeMap<i64, EventId>>,
    links: LinkMap,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, event_id: &EventId) -> Option<ChainPosition> {
        self.positions.get(event_id).copied()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.positions.contains_key(event_id)
    }

    pub fn links(&self) -> &LinkMap {
        &self.links
    }

    /// The event at a position, if any.
    pub fn event_at(&self, position: ChainPosition) -> Option<&EventId> {
        self.chains
            .get(&position.chain_id)?
            .get(&position.sequence_number)
    }

    /// Load a persisted position.
    pub fn restore_position(&mut self, event_id: EventId, slot: StateKey, position: ChainPosition) {
        self.chains
            .entry(position.chain_id)
            .or_default()
            .insert(position.sequence_number, event_id.clone());
        self.slots.insert(event_id.clone(), slot);
        self.positions.insert(event_id, position);
    }

    /// Load a persisted link.
    pub fn restore_link(&mut self, link: ChainLink) {
        self.links.restore_link(link);
    }

    /// Forget the chains holding any of `event_ids`, with all their links.
    ///
    /// A chain never spans rooms, so removing every event of a room removes
    /// whole chains. Returns the IDs of the dropped chains.
    pub fn remove_events<'a>(&mut self, event_ids: impl IntoIterator<Item = &'a EventId>) -> BTreeSet<i64> {
        let dropped: BTreeSet<i64> = event_ids
            .into_iter()
            .filter_map(|id| self.position(id))
            .map(|p| p.chain_id)
            .collect();
        for chain_id in &dropped {
            for event_id in self.chains.remove(chain_id).unwrap_or_default().into_values() {
                self.positions.remove(&event_id);
                self.slots.remove(&event_id);
            }
        }
        self.links.remove_chains(&dropped);
        dropped
    }

    fn next_chain_id(&self) -> i64 {
        self.chains.keys().next_back().map_or(1, |last| last + 1)
    }

    /// Place a state event on a chain and link it to its auth events.
    ///
    /// The event extends the chain of the first auth event for the same slot
    /// when the next position there is free, and starts a new chain
    /// otherwise. Auth events without a position are ignored. Returns the
    /// position and the links that were added; an event that is already
    /// indexed keeps its position and adds no links.
    pub fn allocate(
        &mut self,
        event_id: &EventId,
        slot: StateKey,
        auth_event_ids: &[EventId],
    ) -> (ChainPosition, Vec<ChainLink>) {
        if let Some(position) = self.position(event_id) {
            return (position, Vec::new());
        }

        let auth: Vec<(&EventId, ChainPosition)> = auth_event_ids
            .iter()
            .filter_map(|id| self.position(id).map(|p| (id, p)))
            .collect();

        let inherited = auth
            .iter()
            .find(|(id, _)| self.slots.get(*id) == Some(&slot))
            .map(|(_, p)| ChainPosition::new(p.chain_id, p.sequence_number + 1))
            .filter(|p| self.event_at(*p).is_none());
        let position = inherited.unwrap_or_else(|| ChainPosition::new(self.next_chain_id(), 1));
        self.restore_position(event_id.clone(), slot, position);

        // Keep only auth events not reachable from another auth event.
        let mut reduction: BTreeSet<ChainPosition> = auth
            .iter()
            .map(|(_, p)| *p)
            .filter(|p| p.chain_id != position.chain_id)
            .collect();
        for (i, (_, start)) in auth.iter().enumerate() {
            for (j, (_, end)) in auth.iter().enumerate() {
                if i != j && self.links.exists_path_from(*start, *end) {
                    reduction.remove(end);
                }
            }
        }

        for target in reduction {
            self.links.add_link(position, target);
            let onward: Vec<ChainPosition> = self.links.get_links_from(target).collect();
            for further in onward {
                if further.chain_id != position.chain_id {
                    self.links.add_link(position, further);
                }
            }
        }

        (position, self.links.take_additions())
    }

    /// Highest reachable sequence number per chain for a set of events,
    /// or `None` if any of them is not indexed.
    fn reachable_chains(&self, events: &BTreeSet<EventId>) -> Option<BTreeMap<i64, i64>> {
        let mut chains: BTreeMap<i64, i64> = BTreeMap::new();
        for id in events {
            let position = self.position(id)?;
            let seq = chains.entry(position.chain_id).or_insert(0);
            *seq = (*seq).max(position.sequence_number);
        }

        let mut changed = true;
        while changed {
            changed = false;
            let current: Vec<ChainPosition> = chains
                .iter()
                .map(|(&chain, &seq)| ChainPosition::new(chain, seq))
                .collect();
            for origin in current {
                for target in self.links.get_links_from(origin) {
                    let seq = chains.entry(target.chain_id).or_insert(0);
                    if target.sequence_number > *seq {
                        *seq = target.sequence_number;
                        changed = true;
                    }
                }
            }
        }
        Some(chains)
    }

    /// Events in the auth chain (inclusive) of some but not all state sets.
    ///
    /// Returns `None` when an event in the sets, or one inside a computed
    /// range, is not indexed; callers fall back to walking the graph.
    pub fn auth_chain_difference(&self, state_sets: &[BTreeSet<EventId>]) -> Option<BTreeSet<EventId>> {
        let per_set: Vec<BTreeMap<i64, i64>> = state_sets
            .iter()
            .map(|set| self.reachable_chains(set))
            .collect::<Option<_>>()?;

        let seen: BTreeSet<i64> = per_set.iter().flat_map(|c| c.keys().copied()).collect();
        let mut result = BTreeSet::new();
        for chain in seen {
            let reach = per_set.iter().map(|c| c.get(&chain).copied().unwrap_or(0));
            let min = reach.clone().min().unwrap_or(0);
            let max = reach.max().unwrap_or(0);
            for seq in (min + 1)..=max {
                result.insert(self.event_at(ChainPosition::new(chain, seq))?.clone());
            }
        }
        Some(result)
    }
}
