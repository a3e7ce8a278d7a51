//! Event fixtures for the store tests.

use serde_json::{json, Value};

use concord_core::{
    event_type, Event, EventBuilder, EventView, RoomId, RoomVersion, ServerKeypair, UserId,
};

pub(crate) const ROOM: &str = "!room:example.org";
pub(crate) const ALICE: &str = "@alice:example.org";

pub(crate) fn room_id() -> RoomId {
    RoomId::parse(ROOM).unwrap()
}

pub(crate) fn build(event_type: &str, state_key: Option<&str>, content: Value, prev: &[&Event], auth: &[&Event]) -> Event {
    let depth = prev.iter().map(|e| e.depth()).max().unwrap_or(0) + 1;
    let mut builder = EventBuilder::new(room_id(), UserId::parse(ALICE).unwrap(), event_type)
        .content(content)
        .prev_events(prev.iter().map(|e| e.event_id().clone()).collect())
        .auth_events(auth.iter().map(|e| e.event_id().clone()).collect())
        .depth(depth)
        .origin_server_ts(depth * 1000);
    if let Some(sk) = state_key {
        builder = builder.state_key(sk);
    }
    builder
        .build(&RoomVersion::V10, &ServerKeypair::derive("example.org"))
        .unwrap()
}

/// Create, creator join, power levels.
pub(crate) fn small_room() -> Vec<Event> {
    let create = build(event_type::CREATE, Some(""), json!({"creator": ALICE}), &[], &[]);
    let join = build(
        event_type::MEMBER,
        Some(ALICE),
        json!({"membership": "join"}),
        &[&create],
        &[&create],
    );
    let pl = build(
        event_type::POWER_LEVELS,
        Some(""),
        json!({"users": {ALICE: 100}}),
        &[&join],
        &[&create, &join],
    );
    vec![create, join, pl]
}

pub(crate) fn message(body: &str, prev: &Event, auth: &[&Event]) -> Event {
    build(event_type::MESSAGE, None, json!({"body": body}), &[prev], auth)
}
