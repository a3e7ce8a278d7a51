//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::json;

use concord_core::{event_type, RoomVersion};

use crate::fixtures::{TestRoom, ALICE, BOB, CAROL, ZARA};

/// Users that generated scenarios act as.
pub const USERS: &[&str] = &[ALICE, BOB, CAROL, ZARA];

/// A power level around the interesting thresholds.
pub fn power_level() -> impl Strategy<Value = i64> {
    prop_oneof![Just(0i64), Just(50), Just(100), -5i64..=105]
}

/// A membership value, including one no room version knows.
pub fn membership() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("join"),
        Just("invite"),
        Just("leave"),
        Just("ban"),
        Just("knock"),
        Just("lurk"),
    ]
}

pub fn user() -> impl Strategy<Value = &'static str> {
    prop::sample::select(USERS)
}

/// A room version with hash-based event IDs.
pub fn modern_room_version() -> impl Strategy<Value = &'static RoomVersion> {
    prop_oneof![
        Just(&RoomVersion::V3),
        Just(&RoomVersion::V6),
        Just(&RoomVersion::V8),
        Just(&RoomVersion::V10),
    ]
}

/// One change made on a branch of a room.
#[derive(Debug, Clone)]
pub enum Action {
    SetName { sender: &'static str, name: u8 },
    Join { user: &'static str },
    Leave { user: &'static str },
    SetUserLevel { user: &'static str, level: i64 },
    SetJoinRule { rule: &'static str },
    Message { sender: &'static str },
}

pub fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (user(), any::<u8>()).prop_map(|(sender, name)| Action::SetName { sender, name }),
        user().prop_map(|user| Action::Join { user }),
        user().prop_map(|user| Action::Leave { user }),
        (user(), power_level()).prop_map(|(user, level)| Action::SetUserLevel { user, level }),
        prop::sample::select(&["public", "invite"][..]).prop_map(|rule| Action::SetJoinRule { rule }),
        user().prop_map(|sender| Action::Message { sender }),
    ]
}

/// Apply an action to a room without any auth checks.
pub fn apply(room: &mut TestRoom, action: &Action) {
    match action {
        Action::SetName { sender, name } => {
            room.set_name(sender, &format!("room {name}"));
        }
        Action::Join { user } => {
            room.join(user);
        }
        Action::Leave { user } => {
            room.send_member(user, user, "leave");
        }
        Action::SetUserLevel { user, level } => {
            let mut users = serde_json::Map::new();
            users.insert(ALICE.to_string(), json!(100));
            users.insert(user.to_string(), json!(level));
            room.send_state(ALICE, event_type::POWER_LEVELS, "", json!({ "users": users }));
        }
        Action::SetJoinRule { rule } => {
            room.set_join_rule(rule);
        }
        Action::Message { sender } => {
            room.message(sender, "hello");
        }
    }
}

/// A shared room history followed by two divergent branches.
#[derive(Debug, Clone)]
pub struct ForkPlan {
    pub shared: Vec<Action>,
    pub left: Vec<Action>,
    pub right: Vec<Action>,
}

impl ForkPlan {
    /// Build the base room and the two branch rooms.
    pub fn build(&self, version: &'static RoomVersion) -> (TestRoom, TestRoom, TestRoom) {
        let mut base = TestRoom::new(version);
        base.join(BOB);
        for action in &self.shared {
            apply(&mut base, action);
        }
        let mut left = base.fork();
        for action in &self.left {
            apply(&mut left, action);
        }
        let mut right = base.fork();
        for action in &self.right {
            apply(&mut right, action);
        }
        (base, left, right)
    }
}

impl Arbitrary for ForkPlan {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            prop::collection::vec(action(), 0..4),
            prop::collection::vec(action(), 1..6),
            prop::collection::vec(action(), 1..6),
        )
            .prop_map(|(shared, left, right)| ForkPlan { shared, left, right })
            .boxed()
    }
}
