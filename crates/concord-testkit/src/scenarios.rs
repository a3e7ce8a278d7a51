//! Canned event graphs.
//!
//! Each scenario returns the branch rooms; the state after each branch's
//! last event is the input to state resolution.

use serde_json::json;

use concord_core::{event_type, RoomVersion};

use crate::fixtures::{TestRoom, ALICE, BOB, CAROL};

/// Two branches that disagree only on the room name.
pub fn name_conflict(version: &'static RoomVersion) -> (TestRoom, TestRoom) {
    let mut base = TestRoom::new(version);
    base.join(BOB);
    let mut left = base.fork();
    let mut right = base.fork();
    left.set_name(ALICE, "Left");
    right.set_name(BOB, "Right");
    (left, right)
}

/// Alice bans Bob on one branch while Bob renames the room on the other.
///
/// Resolution must apply the ban and drop Bob's rename, whatever the
/// timestamps say.
pub fn ban_versus_rename(version: &'static RoomVersion) -> (TestRoom, TestRoom) {
    let mut base = TestRoom::new(version);
    base.set_power_levels(json!({"users": {ALICE: 100, BOB: 50}, "state_default": 50}));
    base.join(BOB);
    let mut left = base.fork();
    let mut right = base.fork();
    left.send_member(ALICE, BOB, "ban");
    right.set_name(BOB, "Bob's room");
    (left, right)
}

/// Alice demotes Bob on one branch while Bob, still a moderator on the
/// other, raises Carol.
pub fn demotion_race(version: &'static RoomVersion) -> (TestRoom, TestRoom) {
    let mut base = TestRoom::new(version);
    base.set_power_levels(json!({"users": {ALICE: 100, BOB: 50}}));
    base.join(BOB);
    base.join(CAROL);
    let mut left = base.fork();
    let mut right = base.fork();
    left.set_power_levels(json!({"users": {ALICE: 100}}));
    right.send_state(
        BOB,
        event_type::POWER_LEVELS,
        "",
        json!({"users": {ALICE: 100, BOB: 50, CAROL: 50}}),
    );
    (left, right)
}

/// Join rules turn invite-only on one branch while Carol joins on the other.
pub fn join_rule_race(version: &'static RoomVersion) -> (TestRoom, TestRoom) {
    let base = TestRoom::new(version);
    let mut left = base.fork();
    let mut right = base.fork();
    left.set_join_rule("invite");
    right.join(CAROL);
    (left, right)
}
