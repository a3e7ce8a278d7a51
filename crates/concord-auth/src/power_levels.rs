//! Power level lookups and the power-levels change rule.

use std::collections::BTreeSet;

use serde_json::Value;

use concord_core::content::parse_power_level_strict;
use concord_core::{
    event_type, parse_power_level, AuthError, EventFields, EventView, JsonObject,
    PowerLevelsContent, RoomVersion, StateKey, UserId,
};

use crate::rules::AuthEventMap;

/// Scalar levels compared when power levels change.
const SCALAR_LEVELS: &[&str] = &[
    "users_default",
    "events_default",
    "state_default",
    "ban",
    "redact",
    "kick",
    "invite",
];

/// Sections that hold per-key levels.
const LEVEL_SECTIONS: &[&str] = &["events", "notifications", "users"];

/// Level given to the room creator while no power levels event exists.
pub const CREATOR_DEFAULT_LEVEL: i64 = 100;

/// The current power levels event, if the auth events hold one.
pub fn power_levels_event<'a, A: EventView>(auth_events: &AuthEventMap<'a, A>) -> Option<&'a A> {
    auth_events
        .get(&StateKey::new(event_type::POWER_LEVELS, ""))
        .copied()
}

/// A user's power level.
///
/// With a power levels event: `users[user_id]`, then `users_default`, then 0.
/// Without one the room creator has 100 and everyone else 0.
pub fn get_user_power_level<A: EventView>(user_id: &str, auth_events: &AuthEventMap<'_, A>) -> i64 {
    if let Some(pl) = power_levels_event(auth_events) {
        return PowerLevelsContent::new(pl.content()).user_level(user_id);
    }

    let creator = auth_events
        .get(&StateKey::new(event_type::CREATE, ""))
        .and_then(|create| create.content().get("creator"))
        .and_then(Value::as_str);
    if creator == Some(user_id) {
        CREATOR_DEFAULT_LEVEL
    } else {
        0
    }
}

/// A named level such as `ban` or `invite`, or `default` when unset.
pub fn get_named_level<A: EventView>(auth_events: &AuthEventMap<'_, A>, name: &str, default: i64) -> i64 {
    power_levels_event(auth_events)
        .and_then(|pl| PowerLevelsContent::new(pl.content()).named(name))
        .unwrap_or(default)
}

/// The level needed to send an event of `event_type`.
pub fn get_send_level<A: EventView>(event_type: &str, is_state: bool, power_levels: Option<&A>) -> i64 {
    match power_levels {
        Some(pl) => PowerLevelsContent::new(pl.content()).send_level(event_type, is_state),
        None if is_state => 50,
        None => 0,
    }
}

fn section<'a>(content: &'a JsonObject, name: &str) -> Option<&'a JsonObject> {
    content.get(name).and_then(Value::as_object)
}

fn parse_level(value: &Value) -> Result<i64, AuthError> {
    parse_power_level(value).ok_or_else(|| AuthError::invalid(format!("Not a valid power level: {}", value)))
}

/// Reject malformed power levels content with a 400.
///
/// Every `users` key must be a user ID and every value a level. Room
/// versions with `enforce_int_power_levels` accept only JSON integers.
pub fn validate_power_levels_content(room_version: &RoomVersion, content: &JsonObject) -> Result<(), AuthError> {
    if let Some(users) = section(content, "users") {
        for (user, level) in users {
            UserId::parse(user.as_str())
                .map_err(|_| AuthError::invalid(format!("Not a valid user_id: {}", user)))?;
            parse_level(level)?;
        }
    }

    if !room_version.enforce_int_power_levels {
        return Ok(());
    }

    for (key, value) in content {
        if SCALAR_LEVELS.contains(&key.as_str()) && parse_power_level_strict(value).is_none() {
            return Err(AuthError::invalid(format!("{} must be an integer.", value)));
        }
        if LEVEL_SECTIONS.contains(&key.as_str()) {
            let all_ints = value
                .as_object()
                .map_or(false, |m| m.values().all(|v| parse_power_level_strict(v).is_some()));
            if !all_ints {
                return Err(AuthError::invalid(format!(
                    "{} must be a dict wherein all the values are integers.",
                    value
                )));
            }
        }
    }
    Ok(())
}

/// The power-levels change rule.
///
/// Nothing is compared when there is no previous power levels event. Otherwise
/// for every touched level, in this order:
///
/// 1. unchanged values are skipped,
/// 2. another user's entry may not be changed if it equals the sender's level,
/// 3. neither the old nor the new value may exceed the sender's level.
pub fn check_power_levels<E, A>(
    room_version: &RoomVersion,
    event: &E,
    auth_events: &AuthEventMap<'_, A>,
) -> Result<(), AuthError>
where
    E: EventView + ?Sized,
    A: EventView,
{
    validate_power_levels_content(room_version, event.content())?;

    let Some(current) = power_levels_event(auth_events) else {
        return Ok(());
    };

    let sender = event.sender().as_str();
    let user_level = get_user_power_level(sender, auth_events);
    let old_state = current.content();
    let new_state = event.content();

    let mut levels_to_check: Vec<(String, Option<&str>)> = SCALAR_LEVELS
        .iter()
        .map(|name| (name.to_string(), None))
        .collect();
    if room_version.msc2716_historical {
        levels_to_check.push(("historical".to_string(), None));
    }

    let mut sections = vec!["users", "events"];
    if room_version.limit_notifications_power_levels {
        sections.push("notifications");
    }
    for dir in sections {
        let touched: BTreeSet<&String> = section(old_state, dir)
            .into_iter()
            .chain(section(new_state, dir))
            .flat_map(|m| m.keys())
            .collect();
        levels_to_check.extend(touched.into_iter().map(|k| (k.clone(), Some(dir))));
    }

    for (key, dir) in levels_to_check {
        let (old_loc, new_loc) = match dir {
            Some(dir) => (section(old_state, dir), section(new_state, dir)),
            None => (Some(old_state), Some(new_state)),
        };
        let old_level = old_loc.and_then(|m| m.get(&key)).map(parse_level).transpose()?;
        let new_level = new_loc.and_then(|m| m.get(&key)).map(parse_level).transpose()?;

        if old_level.is_some() && old_level == new_level {
            continue;
        }

        if dir == Some("users") && key != sender && old_level == Some(user_level) {
            return Err(AuthError::forbidden(
                "You don't have permission to remove ops level equal to your own",
            ));
        }

        let old_too_big = old_level.map_or(false, |l| l > user_level);
        let new_too_big = new_level.map_or(false, |l| l > user_level);
        if old_too_big || new_too_big {
            return Err(AuthError::forbidden(
                "You don't have permission to add ops level greater than your own",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRoom;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(v: Value) -> JsonObject {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_creator_gets_100_without_power_levels() {
        let room = TestRoom::bare(&RoomVersion::V10);
        let auth = room.auth_map();
        assert_eq!(get_user_power_level(TestRoom::ALICE, &auth), 100);
        assert_eq!(get_user_power_level(TestRoom::BOB, &auth), 0);
    }

    #[test]
    fn test_levels_from_power_levels_event() {
        let room = TestRoom::new(&RoomVersion::V10);
        let auth = room.auth_map();
        assert_eq!(get_user_power_level(TestRoom::ALICE, &auth), 100);
        assert_eq!(get_user_power_level(TestRoom::BOB, &auth), 0);
        assert_eq!(get_named_level(&auth, "ban", 50), 50);
        assert_eq!(get_named_level(&auth, "invite", 0), 0);
        assert_eq!(get_send_level("m.room.name", true, power_levels_event(&auth)), 50);
    }

    #[test]
    fn test_validate_rejects_bad_user_keys() {
        let bad = obj(json!({"users": {"not-a-user": 10}}));
        let err = validate_power_levels_content(&RoomVersion::V6, &bad).unwrap_err();
        assert_eq!(err.code, 400);

        let bad_level = obj(json!({"users": {"@a:x": "ten"}}));
        assert_eq!(
            validate_power_levels_content(&RoomVersion::V6, &bad_level).unwrap_err().code,
            400
        );
    }

    #[test]
    fn test_int_enforcement_depends_on_version() {
        let stringy = obj(json!({"ban": "50", "users": {"@a:x": "10"}}));
        assert!(validate_power_levels_content(&RoomVersion::V9, &stringy).is_ok());
        assert_eq!(
            validate_power_levels_content(&RoomVersion::V10, &stringy).unwrap_err().code,
            400
        );
        let not_a_map = obj(json!({"events": []}));
        assert!(validate_power_levels_content(&RoomVersion::V10, &not_a_map).is_err());
    }

    #[test]
    fn test_unchanged_values_skip_ceiling() {
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.set_power_levels(json!({
            "users": {TestRoom::ALICE: 100, TestRoom::BOB: 50},
            "events": {"m.room.power_levels": 50},
            "ban": 80
        }));
        // Bob re-sends content with a level above his own left untouched.
        let event = room.event(
            TestRoom::BOB,
            event_type::POWER_LEVELS,
            Some(""),
            json!({
                "users": {TestRoom::ALICE: 100, TestRoom::BOB: 50},
                "events": {"m.room.power_levels": 50},
                "ban": 80,
                "kick": 40
            }),
        );
        assert!(check_power_levels(room.version, &event, &room.auth_map()).is_ok());
    }

    #[test]
    fn test_peer_at_same_level_is_protected() {
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.set_power_levels(json!({
            "users": {TestRoom::ALICE: 50, TestRoom::BOB: 50}
        }));
        let event = room.event(
            TestRoom::ALICE,
            event_type::POWER_LEVELS,
            Some(""),
            json!({"users": {TestRoom::ALICE: 50, TestRoom::BOB: 0}}),
        );
        let err = check_power_levels(room.version, &event, &room.auth_map()).unwrap_err();
        assert!(err.reason.contains("equal to your own"));

        // Demoting yourself is allowed.
        let event = room.event(
            TestRoom::ALICE,
            event_type::POWER_LEVELS,
            Some(""),
            json!({"users": {TestRoom::ALICE: 10, TestRoom::BOB: 50}}),
        );
        let err = check_power_levels(room.version, &event, &room.auth_map());
        assert!(err.is_ok());
    }

    #[test]
    fn test_notifications_only_limited_when_flagged() {
        let mut room = TestRoom::new(&RoomVersion::V5);
        room.set_power_levels(json!({
            "users": {TestRoom::ALICE: 100, TestRoom::BOB: 10},
            "notifications": {"room": 50}
        }));
        let content = json!({
            "users": {TestRoom::ALICE: 100, TestRoom::BOB: 10},
            "notifications": {"room": 20}
        });
        let event = room.event(TestRoom::BOB, event_type::POWER_LEVELS, Some(""), content.clone());
        assert!(check_power_levels(&RoomVersion::V5, &event, &room.auth_map()).is_ok());
        assert!(check_power_levels(&RoomVersion::V6, &event, &room.auth_map()).is_err());
    }

    #[test]
    fn test_raise_events_default_above_own_level() {
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.join(TestRoom::BOB);
        room.set_power_levels(json!({
            "users": {TestRoom::ALICE: 100},
            "events": {"m.room.power_levels": 0}
        }));
        let event = room.event(
            TestRoom::BOB,
            event_type::POWER_LEVELS,
            Some(""),
            json!({
                "users": {TestRoom::ALICE: 100},
                "events": {"m.room.power_levels": 0},
                "events_default": 10
            }),
        );
        let err = check_power_levels(room.version, &event, &room.auth_map()).unwrap_err();
        assert!(err.reason.contains("greater than your own"));
        let err = crate::check_auth_rules_for_event(room.version, &event, room.auth_events()).unwrap_err();
        assert!(err.reason.contains("greater than your own"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_accepted_changes_stay_within_sender_level(
            bob_level in 0i64..=100,
            old_ban in 0i64..=100,
            new_ban in 0i64..=100,
            old_default in 0i64..=100,
            new_default in 0i64..=100,
        ) {
            let mut room = TestRoom::new(&RoomVersion::V10);
            room.set_power_levels(json!({
                "users": {TestRoom::ALICE: 100, TestRoom::BOB: bob_level},
                "ban": old_ban,
                "events_default": old_default,
            }));
            let event = room.event(
                TestRoom::BOB,
                event_type::POWER_LEVELS,
                Some(""),
                json!({
                    "users": {TestRoom::ALICE: 100, TestRoom::BOB: bob_level},
                    "ban": new_ban,
                    "events_default": new_default,
                }),
            );
            if check_power_levels(room.version, &event, &room.auth_map()).is_ok() {
                for (old, new) in [(old_ban, new_ban), (old_default, new_default)] {
                    if old != new {
                        prop_assert!(old <= bob_level && new <= bob_level);
                    }
                }
            }
        }
    }
}
