//! Selection of the state an event is authorized against.

use std::collections::BTreeSet;

use serde_json::Value;

use concord_core::{event_type, AuthError, EventFields, Membership, RoomVersion, StateKey, AUTHORISING_USER};

/// The `(type, state_key)` slots whose current values authorize `event`.
///
/// Create events need nothing. Every other event needs the create event,
/// the power levels, and the sender's membership. Membership events also
/// need the target's membership and, depending on the change, the join
/// rules, a third-party invite, or the authorising user's membership.
///
/// Works on events under construction so callers can prefetch auth events
/// before the event exists.
pub fn auth_types_for_event<E: EventFields + ?Sized>(
    room_version: &RoomVersion,
    event: &E,
) -> Result<BTreeSet<StateKey>, AuthError> {
    let mut types = BTreeSet::new();
    if event.event_type() == event_type::CREATE {
        return Ok(types);
    }

    types.insert(StateKey::new(event_type::POWER_LEVELS, ""));
    types.insert(StateKey::new(event_type::MEMBER, event.sender().as_str()));
    types.insert(StateKey::new(event_type::CREATE, ""));

    if event.event_type() == event_type::MEMBER {
        let membership = event.membership();
        if matches!(membership, Membership::Unknown(ref m) if m.is_empty()) {
            return Err(AuthError::invalid("Membership event has no membership"));
        }

        if matches!(
            membership,
            Membership::Join | Membership::Invite | Membership::Knock
        ) {
            types.insert(StateKey::new(event_type::JOIN_RULES, ""));
        }

        let target = event
            .state_key()
            .ok_or_else(|| AuthError::invalid("Membership event has no state_key"))?;
        types.insert(StateKey::new(event_type::MEMBER, target));

        if membership == Membership::Invite {
            if let Some(tpi) = event.content().get("third_party_invite") {
                let token = tpi
                    .get("signed")
                    .and_then(|s| s.get("token"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| AuthError::invalid("third_party_invite has no signed token"))?;
                types.insert(StateKey::new(event_type::THIRD_PARTY_INVITE, token));
            }
        }

        if room_version.restricted_join_rule && membership == Membership::Join {
            if let Some(user) = event.content().get(AUTHORISING_USER) {
                let user = user
                    .as_str()
                    .ok_or_else(|| AuthError::invalid("Authorising user is not a string"))?;
                types.insert(StateKey::new(event_type::MEMBER, user));
            }
        }
    }

    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{EventBuilder, RoomId, UserId};
    use serde_json::json;

    fn builder(event_type: &str, state_key: Option<&str>, content: Value) -> EventBuilder {
        let b = EventBuilder::new(
            RoomId::parse("!r:a.org").unwrap(),
            UserId::parse("@alice:a.org").unwrap(),
            event_type,
        )
        .content(content);
        match state_key {
            Some(sk) => b.state_key(sk),
            None => b,
        }
    }

    fn key(t: &str, sk: &str) -> StateKey {
        StateKey::new(t, sk)
    }

    #[test]
    fn test_create_needs_nothing() {
        let b = builder(event_type::CREATE, Some(""), json!({"creator": "@alice:a.org"}));
        assert!(auth_types_for_event(&RoomVersion::V10, &b).unwrap().is_empty());
    }

    #[test]
    fn test_message_needs_base_three() {
        let b = builder("m.room.message", None, json!({"body": "x"}));
        let types = auth_types_for_event(&RoomVersion::V10, &b).unwrap();
        assert_eq!(types.len(), 3);
        assert!(types.contains(&key(event_type::MEMBER, "@alice:a.org")));
    }

    #[test]
    fn test_invite_includes_target_join_rules_and_3pid() {
        let b = builder(
            event_type::MEMBER,
            Some("@bob:b.org"),
            json!({"membership": "invite", "third_party_invite": {"signed": {"token": "tok"}}}),
        );
        let types = auth_types_for_event(&RoomVersion::V10, &b).unwrap();
        assert!(types.contains(&key(event_type::JOIN_RULES, "")));
        assert!(types.contains(&key(event_type::MEMBER, "@bob:b.org")));
        assert!(types.contains(&key(event_type::THIRD_PARTY_INVITE, "tok")));
    }

    #[test]
    fn test_leave_skips_join_rules() {
        let b = builder(event_type::MEMBER, Some("@bob:b.org"), json!({"membership": "leave"}));
        let types = auth_types_for_event(&RoomVersion::V10, &b).unwrap();
        assert!(!types.contains(&key(event_type::JOIN_RULES, "")));
    }

    #[test]
    fn test_authorising_user_only_in_restricted_versions() {
        let content = json!({"membership": "join", "join_authorised_via_users_server": "@carol:c.org"});
        let b = builder(event_type::MEMBER, Some("@alice:a.org"), content);
        let carol = key(event_type::MEMBER, "@carol:c.org");
        assert!(auth_types_for_event(&RoomVersion::V8, &b).unwrap().contains(&carol));
        assert!(!auth_types_for_event(&RoomVersion::V7, &b).unwrap().contains(&carol));
    }

    #[test]
    fn test_malformed_membership_is_invalid() {
        let b = builder(event_type::MEMBER, Some("@alice:a.org"), json!({}));
        assert_eq!(auth_types_for_event(&RoomVersion::V10, &b).unwrap_err().code, 400);
    }
}
