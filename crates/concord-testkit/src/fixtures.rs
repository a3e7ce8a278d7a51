//! Test fixtures and helpers.
//!
//! [`TestRoom`] builds signed events on top of a room, tracking the state
//! after each one. Rooms can be forked to produce divergent branches for
//! state resolution tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{json, Value};

use concord_auth::{auth_types_for_event, AuthEventMap};
use concord_core::{
    event_type, Event, EventBuilder, EventFields, EventId, EventMetadata, EventView, KeyRing,
    RoomId, RoomVersion, ServerKeypair, StateDelta, StateKey, StateMap, StoredEvent, UserId,
};
use concord_store::{EventMap, EventStore, Result as StoreResult};

pub const ROOM: &str = "!room:example.org";
pub const ALICE: &str = "@alice:example.org";
pub const BOB: &str = "@bob:example.org";
pub const CAROL: &str = "@carol:example.org";
pub const ZARA: &str = "@zara:other.org";

/// Servers whose keys [`key_ring`] knows.
pub const SERVERS: &[&str] = &["example.org", "other.org"];

/// A key ring holding the derived keys of every fixture server.
pub fn key_ring() -> KeyRing {
    let mut ring = KeyRing::new();
    for server in SERVERS {
        ring.add_server(&ServerKeypair::derive(server));
    }
    ring
}

pub fn room_id() -> RoomId {
    RoomId::parse(ROOM).expect("fixture room id")
}

/// A room under construction.
///
/// Every built event names the current heads as prev events and the current
/// state as auth events. No auth rules are applied: tests decide what is
/// valid.
#[derive(Debug, Clone)]
pub struct TestRoom {
    pub version: &'static RoomVersion,
    state: BTreeMap<StateKey, Event>,
    heads: Vec<Event>,
    timeline: Vec<Event>,
    state_after: HashMap<EventId, StateMap>,
    clock: i64,
}

impl TestRoom {
    /// Create event plus the creator's join.
    pub fn bare(version: &'static RoomVersion) -> Self {
        Self::with_create_content(version, json!({"creator": ALICE, "room_version": version.identifier}))
    }

    pub fn with_create_content(version: &'static RoomVersion, content: Value) -> Self {
        let mut room = Self {
            version,
            state: BTreeMap::new(),
            heads: Vec::new(),
            timeline: Vec::new(),
            state_after: HashMap::new(),
            clock: 0,
        };
        room.send_state(ALICE, event_type::CREATE, "", content);
        room.join(ALICE);
        room
    }

    /// A public room with power levels where Alice has 100.
    pub fn new(version: &'static RoomVersion) -> Self {
        let mut room = Self::bare(version);
        room.set_power_levels(json!({"users": {ALICE: 100}}));
        room.set_join_rule("public");
        room
    }

    /// An independent copy that continues from the same point.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Make the next event also follow the heads of `other`, and learn its
    /// events. State is left as this room sees it.
    pub fn merge_heads(&mut self, other: &TestRoom) {
        for head in &other.heads {
            if !self.heads.iter().any(|h| h.event_id() == head.event_id()) {
                self.heads.push(head.clone());
            }
        }
        for event in &other.timeline {
            if !self.state_after.contains_key(event.event_id()) {
                self.timeline.push(event.clone());
                if let Some(state) = other.state_after.get(event.event_id()) {
                    self.state_after.insert(event.event_id().clone(), state.clone());
                }
            }
        }
        self.clock = self.clock.max(other.clock);
    }

    fn builder(&mut self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> EventBuilder {
        let depth = self.heads.iter().map(|e| e.depth()).max().unwrap_or(0) + 1;
        self.clock += 1000;
        let mut builder = EventBuilder::new(room_id(), UserId::parse(sender).expect("fixture user"), event_type)
            .content(content)
            .prev_events(self.heads.iter().map(|e| e.event_id().clone()).collect())
            .depth(depth)
            .origin_server_ts(self.clock);
        if let Some(sk) = state_key {
            builder = builder.state_key(sk);
        }
        builder
    }

    fn auth_ids_for(&self, builder: &EventBuilder) -> Vec<EventId> {
        match auth_types_for_event(self.version, builder) {
            Ok(types) => types
                .iter()
                .filter_map(|slot| self.state.get(slot))
                .map(|e| e.event_id().clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn sign(&self, builder: EventBuilder) -> Event {
        let server = builder
            .sender()
            .server_name()
            .expect("fixture user has a server")
            .to_string();
        builder
            .build(self.version, &ServerKeypair::derive(&server))
            .expect("fixture event builds")
    }

    /// Build an event on top of the room without adding it.
    pub fn event(&mut self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> Event {
        let builder = self.builder(sender, event_type, state_key, content);
        let auth = self.auth_ids_for(&builder);
        self.sign(builder.auth_events(auth))
    }

    /// Like [`TestRoom::event`] with explicit auth events.
    pub fn event_with_auth(
        &mut self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
        auth: &[&Event],
    ) -> Event {
        let builder = self
            .builder(sender, event_type, state_key, content)
            .auth_events(auth.iter().map(|e| e.event_id().clone()).collect());
        self.sign(builder)
    }

    /// Add an already built event on top of the room, updating state.
    pub fn push(&mut self, event: Event) -> Event {
        if let Some(slot) = event.state_slot() {
            self.state.insert(slot, event.clone());
        }
        self.heads.retain(|h| !event.prev_event_ids().contains(h.event_id()));
        self.heads.push(event.clone());
        self.state_after.insert(event.event_id().clone(), self.state_map());
        self.timeline.push(event.clone());
        event
    }

    pub fn send(&mut self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> Event {
        let event = self.event(sender, event_type, state_key, content);
        self.push(event)
    }

    pub fn send_state(&mut self, sender: &str, event_type: &str, state_key: &str, content: Value) -> Event {
        self.send(sender, event_type, Some(state_key), content)
    }

    pub fn send_member(&mut self, sender: &str, target: &str, membership: &str) -> Event {
        self.send_state(sender, event_type::MEMBER, target, json!({"membership": membership}))
    }

    pub fn join(&mut self, user: &str) -> Event {
        self.send_member(user, user, "join")
    }

    pub fn invite_and_join(&mut self, user: &str) -> Event {
        self.send_member(ALICE, user, "invite");
        self.join(user)
    }

    pub fn set_power_levels(&mut self, content: Value) -> Event {
        self.send_state(ALICE, event_type::POWER_LEVELS, "", content)
    }

    pub fn set_join_rule(&mut self, rule: &str) -> Event {
        self.send_state(ALICE, event_type::JOIN_RULES, "", json!({"join_rule": rule}))
    }

    pub fn set_name(&mut self, sender: &str, name: &str) -> Event {
        self.send_state(sender, event_type::NAME, "", json!({"name": name}))
    }

    pub fn message(&mut self, sender: &str, body: &str) -> Event {
        self.send(sender, event_type::MESSAGE, None, json!({"msgtype": "m.text", "body": body}))
    }

    /// A redaction of `target`, built but not added.
    pub fn redaction(&mut self, sender: &str, target: &Event) -> Event {
        let builder = self
            .builder(sender, event_type::REDACTION, None, json!({}))
            .redacts(target.event_id().clone());
        let auth = self.auth_ids_for(&builder);
        self.sign(builder.auth_events(auth))
    }

    pub fn create_event(&self) -> &Event {
        self.state_event(event_type::CREATE, "")
    }

    /// The current event in a state slot.
    ///
    /// Panics when the slot is empty.
    pub fn state_event(&self, event_type: &str, state_key: &str) -> &Event {
        &self.state[&StateKey::new(event_type, state_key)]
    }

    pub fn state_map(&self) -> StateMap {
        self.state
            .iter()
            .map(|(k, e)| (k.clone(), e.event_id().clone()))
            .collect()
    }

    /// The state after an event of this room.
    pub fn state_after(&self, event_id: &EventId) -> Option<&StateMap> {
        self.state_after.get(event_id)
    }

    pub fn auth_map(&self) -> AuthEventMap<'_, Event> {
        self.state.iter().map(|(k, e)| (k.clone(), e)).collect()
    }

    pub fn heads(&self) -> BTreeSet<EventId> {
        self.heads.iter().map(|e| e.event_id().clone()).collect()
    }

    pub fn last(&self) -> &Event {
        self.timeline.last().expect("room has a create event")
    }

    /// Every event in the order it was added.
    pub fn events(&self) -> &[Event] {
        &self.timeline
    }

    /// Every event of this room, keyed by ID.
    pub fn event_map(&self) -> EventMap {
        self.timeline
            .iter()
            .map(|e| (e.event_id().clone(), StoredEvent::new(e.clone(), EventMetadata::default())))
            .collect()
    }

    /// Write the room into a store: events, the state after each, the chain
    /// cover for state events, the current state and the heads.
    pub async fn persist<S>(&self, store: &S) -> StoreResult<()>
    where
        S: EventStore + ?Sized,
    {
        let room_id = room_id();
        store.store_room_version(&room_id, self.version).await?;
        for event in &self.timeline {
            store.insert_event(event, &EventMetadata::default()).await?;
            if let Some(state) = self.state_after.get(event.event_id()) {
                let delta = StateDelta::between(&StateMap::new(), state);
                store.store_state_delta(&room_id, event.event_id(), None, &delta).await?;
            }
            if event.is_state() {
                store.allocate_chain(event).await?;
            }
        }
        let current = store.get_current_state(&room_id).await?;
        store
            .apply_current_state_delta(&room_id, &StateDelta::between(&current, &self.state_map()))
            .await?;
        store.set_forward_extremities(&room_id, &self.heads()).await?;
        Ok(())
    }
}

/// The union of several rooms' event maps.
pub fn merged_event_map(rooms: &[&TestRoom]) -> EventMap {
    let mut map = EventMap::new();
    for room in rooms {
        map.extend(room.event_map());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_auth::check_auth_rules_for_event;
    use concord_store::MemoryStore;

    #[test]
    fn test_new_room_events_pass_auth() {
        let room = TestRoom::new(&RoomVersion::V10);
        let events = room.events();
        assert_eq!(events.len(), 4);
        for event in events {
            let auth: Vec<&Event> = events
                .iter()
                .filter(|e| event.auth_event_ids().contains(e.event_id()))
                .collect();
            assert!(
                check_auth_rules_for_event(room.version, event, auth).is_ok(),
                "{} failed auth",
                event.event_type()
            );
        }
    }

    #[test]
    fn test_fork_diverges() {
        let mut base = TestRoom::new(&RoomVersion::V10);
        let mut a = base.fork();
        let mut b = base.fork();
        a.set_name(ALICE, "A");
        b.set_name(ALICE, "B");
        base.message(ALICE, "unchanged");

        assert_ne!(
            a.state_event(event_type::NAME, "").event_id(),
            b.state_event(event_type::NAME, "").event_id()
        );
        // Both branches share the base events.
        let shared = base.events()[0].event_id();
        assert!(a.event_map().contains_key(shared));
        assert!(b.event_map().contains_key(shared));
    }

    #[test]
    fn test_merge_heads() {
        let base = TestRoom::new(&RoomVersion::V10);
        let mut a = base.fork();
        let mut b = base.fork();
        a.set_name(ALICE, "A");
        b.set_name(ALICE, "B");
        a.merge_heads(&b);
        assert_eq!(a.heads().len(), 2);
        let merged = a.message(ALICE, "after");
        assert_eq!(merged.prev_event_ids().len(), 2);
        assert_eq!(a.heads(), BTreeSet::from([merged.event_id().clone()]));
    }

    #[tokio::test]
    async fn test_persist() {
        let room = TestRoom::new(&RoomVersion::V10);
        let store = MemoryStore::new();
        room.persist(&store).await.unwrap();

        assert_eq!(store.get_current_state(&room_id()).await.unwrap(), room.state_map());
        assert_eq!(store.get_forward_extremities(&room_id()).await.unwrap(), room.heads());
        let last = room.last().event_id();
        assert_eq!(store.get_state_at(last).await.unwrap().as_ref(), room.state_after(last));
        assert!(store.get_chain_position(room.create_event().event_id()).await.unwrap().is_some());
    }
}
