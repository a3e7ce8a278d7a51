//! A small in-memory room used by the unit tests.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use concord_core::{
    event_type, Event, EventBuilder, EventFields, EventId, EventView, RoomId, RoomVersion,
    ServerKeypair, StateKey, UserId,
};

use crate::auth_types::auth_types_for_event;
use crate::rules::AuthEventMap;

pub(crate) struct TestRoom {
    pub version: &'static RoomVersion,
    pub create: Event,
    state: BTreeMap<StateKey, Event>,
    timeline: Vec<Event>,
}

impl TestRoom {
    pub const ROOM: &'static str = "!room:example.org";
    pub const ALICE: &'static str = "@alice:example.org";
    pub const BOB: &'static str = "@bob:example.org";
    pub const CAROL: &'static str = "@carol:other.org";

    /// Create event plus the creator's join.
    pub fn bare(version: &'static RoomVersion) -> Self {
        Self::with_create_content(version, json!({"creator": Self::ALICE}))
    }

    pub fn with_create_content(version: &'static RoomVersion, content: Value) -> Self {
        let create = Self::build_event(
            version,
            Self::ALICE,
            event_type::CREATE,
            Some(""),
            content,
            &[],
            &[],
        );
        let mut room = Self {
            version,
            create: create.clone(),
            state: BTreeMap::new(),
            timeline: vec![create.clone()],
        };
        room.state.insert(StateKey::new(event_type::CREATE, ""), create);
        room.send_member(Self::ALICE, Self::ALICE, "join");
        room
    }

    /// A room with power levels (Alice at 100) and an invite-only join rule.
    pub fn new(version: &'static RoomVersion) -> Self {
        let mut room = Self::bare(version);
        room.set_power_levels(json!({"users": {Self::ALICE: 100}}));
        room.set_join_rule("invite");
        room
    }

    pub fn build_event(
        version: &RoomVersion,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
        prev: &[&Event],
        auth: &[&Event],
    ) -> Event {
        Self::build_event_in(Self::ROOM, version, sender, event_type, state_key, content, prev, auth)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_event_in(
        room_id: &str,
        version: &RoomVersion,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
        prev: &[&Event],
        auth: &[&Event],
    ) -> Event {
        let sender = UserId::parse(sender).unwrap();
        let key = ServerKeypair::derive(sender.server_name().unwrap());
        let depth = prev.iter().map(|e| e.depth()).max().unwrap_or(0) + 1;
        let mut builder = EventBuilder::new(RoomId::parse(room_id).unwrap(), sender, event_type)
            .content(content)
            .prev_events(prev.iter().map(|e| e.event_id().clone()).collect())
            .auth_events(auth.iter().map(|e| e.event_id().clone()).collect())
            .depth(depth)
            .origin_server_ts(depth * 1000);
        if let Some(sk) = state_key {
            builder = builder.state_key(sk);
        }
        builder.build(version, &key).unwrap()
    }

    fn builder(&self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> EventBuilder {
        let last = self.timeline.last().unwrap();
        let mut builder = EventBuilder::new(
            RoomId::parse(Self::ROOM).unwrap(),
            UserId::parse(sender).unwrap(),
            event_type,
        )
        .content(content)
        .prev_events(vec![last.event_id().clone()])
        .depth(last.depth() + 1)
        .origin_server_ts((last.depth() + 1) * 1000);
        if let Some(sk) = state_key {
            builder = builder.state_key(sk);
        }
        builder
    }

    fn finish(&self, builder: EventBuilder) -> Event {
        let auth_ids = match auth_types_for_event(self.version, &builder) {
            Ok(types) => types
                .iter()
                .filter_map(|slot| self.state.get(slot))
                .map(|e| e.event_id().clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        let key = ServerKeypair::derive(builder.sender().server_name().unwrap());
        builder.auth_events(auth_ids).build(self.version, &key).unwrap()
    }

    /// Build an event on top of the timeline without adding it.
    pub fn event(&self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> Event {
        self.finish(self.builder(sender, event_type, state_key, content))
    }

    /// Like [`TestRoom::event`] with explicit auth event IDs.
    pub fn event_with_auth(
        &self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
        auth: Vec<EventId>,
    ) -> Event {
        let key = ServerKeypair::derive(UserId::parse(sender).unwrap().server_name().unwrap());
        self.builder(sender, event_type, state_key, content)
            .auth_events(auth)
            .build(self.version, &key)
            .unwrap()
    }

    /// Append an event to the timeline, updating state. No auth is applied.
    pub fn send(&mut self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> Event {
        let event = self.event(sender, event_type, state_key, content);
        if let Some(slot) = event.state_slot() {
            self.state.insert(slot, event.clone());
        }
        self.timeline.push(event.clone());
        event
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

    pub fn join_via_invite(&mut self, user: &str) -> Event {
        self.send_member(Self::ALICE, user, "invite");
        self.join(user)
    }

    pub fn set_power_levels(&mut self, content: Value) -> Event {
        self.send_state(Self::ALICE, event_type::POWER_LEVELS, "", content)
    }

    pub fn set_join_rule(&mut self, rule: &str) -> Event {
        self.send_state(Self::ALICE, event_type::JOIN_RULES, "", json!({"join_rule": rule}))
    }

    pub fn redaction(&self, sender: &str, target: &Event) -> Event {
        let builder = self
            .builder(sender, event_type::REDACTION, None, json!({}))
            .redacts(target.event_id().clone());
        self.finish(builder)
    }

    pub fn state_event(&self, event_type: &str) -> &Event {
        &self.state[&StateKey::new(event_type, "")]
    }

    pub fn auth_events(&self) -> Vec<&Event> {
        self.state.values().collect()
    }

    pub fn auth_map(&self) -> AuthEventMap<'_, Event> {
        self.state.iter().map(|(k, e)| (k.clone(), e)).collect()
    }

    pub fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.timeline.iter()
    }
}
