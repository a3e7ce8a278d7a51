//! The membership change rules.

use serde_json::Value;
use tracing::debug;

use concord_core::{
    event_type, AuthError, EventContent, EventFields, EventView, JoinRule, Membership,
    RoomVersion, StateKey, UserId, AUTHORISING_USER,
};

use crate::power_levels::{get_named_level, get_user_power_level};
use crate::rules::{check_federation, check_joined_room, AuthEventMap};
use crate::third_party_invite::verify_third_party_invite;

fn membership_of<A: EventView>(auth_events: &AuthEventMap<'_, A>, user_id: &str) -> Option<Membership> {
    auth_events
        .get(&StateKey::new(event_type::MEMBER, user_id))
        .map(|m| m.membership())
}

fn join_rule_of<A: EventView>(auth_events: &AuthEventMap<'_, A>) -> JoinRule {
    match auth_events
        .get(&StateKey::new(event_type::JOIN_RULES, ""))
        .map(|e| e.typed_content())
    {
        Some(EventContent::JoinRules(rules)) => rules.join_rule,
        _ => JoinRule::Invite,
    }
}

/// Whether this is the creator's own join directly after the create event.
fn is_creator_bootstrap<E, A>(event: &E, membership: &Membership, auth_events: &AuthEventMap<'_, A>) -> bool
where
    E: EventView + ?Sized,
    A: EventView,
{
    if *membership != Membership::Join || event.prev_event_ids().len() != 1 {
        return false;
    }
    let Some(create) = auth_events.get(&StateKey::new(event_type::CREATE, "")) else {
        return false;
    };
    if event.prev_event_ids()[0] != *create.event_id() {
        return false;
    }
    let creator = create.content().get("creator").and_then(Value::as_str);
    creator.is_some() && creator == event.state_key()
}

/// Decide whether a membership change is allowed.
pub fn check_membership_change<E, A>(
    room_version: &RoomVersion,
    event: &E,
    auth_events: &AuthEventMap<'_, A>,
) -> Result<(), AuthError>
where
    E: EventView + ?Sized,
    A: EventView,
{
    let membership = event.membership();
    if matches!(membership, Membership::Unknown(ref m) if m.is_empty()) {
        return Err(AuthError::invalid("Membership event without membership"));
    }

    if is_creator_bootstrap(event, &membership, auth_events) {
        return Ok(());
    }

    let target_id = event
        .state_key()
        .ok_or_else(|| AuthError::invalid("Membership event has no state_key"))?;
    let target = UserId::parse(target_id)
        .map_err(|_| AuthError::invalid(format!("Not a valid user_id: {}", target_id)))?;
    let sender = event.sender().as_str();
    let room_id = event.room_id().as_str();

    check_federation(room_id, target.server_name().unwrap_or(""), auth_events)?;

    let caller = membership_of(auth_events, sender);
    let caller_in_room = caller == Some(Membership::Join);
    let caller_invited = caller == Some(Membership::Invite);
    let caller_knocked = room_version.knock_join_rule && caller == Some(Membership::Knock);

    let target_membership = membership_of(auth_events, target_id);
    let target_in_room = target_membership == Some(Membership::Join);
    let target_banned = target_membership == Some(Membership::Ban);

    let join_rule = join_rule_of(auth_events);

    let user_level = get_user_power_level(sender, auth_events);
    let target_level = get_user_power_level(target_id, auth_events);
    let invite_level = get_named_level(auth_events, "invite", 0);
    let ban_level = get_named_level(auth_events, "ban", 50);

    debug!(
        membership = membership.as_str(),
        caller_in_room,
        caller_invited,
        target_in_room,
        target_banned,
        ?join_rule,
        user_level,
        target_level,
        "checking membership change"
    );

    if membership == Membership::Invite && event.content().contains_key("third_party_invite") {
        if !verify_third_party_invite(event, auth_events) {
            return Err(AuthError::forbidden("You are not invited to this room."));
        }
        if target_banned {
            return Err(AuthError::forbidden(format!("{} is banned from the room", target_id)));
        }
        return Ok(());
    }

    let is_knock = room_version.knock_join_rule && membership == Membership::Knock;
    if membership != Membership::Join && !is_knock {
        if (caller_invited || caller_knocked)
            && membership == Membership::Leave
            && target_id == sender
        {
            return Ok(());
        }
        if !caller_in_room {
            return Err(AuthError::forbidden(format!("{} not in room {}.", sender, room_id)));
        }
    }

    match membership {
        Membership::Invite => {
            if target_banned {
                return Err(AuthError::forbidden(format!("{} is banned from the room", target_id)));
            }
            if target_in_room {
                return Err(AuthError::forbidden(format!("{} is already in the room.", target_id)));
            }
            if user_level < invite_level {
                return Err(AuthError::forbidden("You don't have permission to invite users"));
            }
        }
        Membership::Join => {
            check_join(
                room_version,
                event,
                auth_events,
                &join_rule,
                target_id,
                target_banned,
                caller_in_room || caller_invited,
                invite_level,
            )?;
        }
        Membership::Leave => {
            if target_banned && user_level < ban_level {
                return Err(AuthError::forbidden(format!("You cannot unban user {}.", target_id)));
            }
            if target_id != sender {
                let kick_level = get_named_level(auth_events, "kick", 50);
                if user_level < kick_level || user_level <= target_level {
                    return Err(AuthError::forbidden(format!("You cannot kick user {}.", target_id)));
                }
            }
        }
        Membership::Ban => {
            if user_level < ban_level || user_level <= target_level {
                return Err(AuthError::forbidden("You don't have permission to ban"));
            }
        }
        Membership::Knock if room_version.knock_join_rule => {
            let knockable = join_rule == JoinRule::Knock
                || (room_version.knock_restricted_join_rule && join_rule == JoinRule::KnockRestricted);
            if !knockable {
                return Err(AuthError::forbidden("You don't have permission to knock"));
            }
            if target_id != sender {
                return Err(AuthError::forbidden("You cannot knock for other users"));
            }
            if target_in_room {
                return Err(AuthError::forbidden("You cannot knock on a room you are already in"));
            }
            if caller_invited {
                return Err(AuthError::forbidden("You are already invited to this room"));
            }
            if target_banned {
                return Err(AuthError::forbidden("You are banned from this room"));
            }
        }
        other => {
            return Err(AuthError::invariant(format!("Unknown membership {}", other.as_str())));
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_join<E, A>(
    room_version: &RoomVersion,
    event: &E,
    auth_events: &AuthEventMap<'_, A>,
    join_rule: &JoinRule,
    target_id: &str,
    target_banned: bool,
    caller_in_or_invited: bool,
    invite_level: i64,
) -> Result<(), AuthError>
where
    E: EventView + ?Sized,
    A: EventView,
{
    if event.sender().as_str() != target_id {
        return Err(AuthError::forbidden("Cannot force another user to join."));
    }
    if target_banned {
        return Err(AuthError::forbidden("You are banned from this room"));
    }

    let restricted = (room_version.restricted_join_rule && *join_rule == JoinRule::Restricted)
        || (room_version.knock_restricted_join_rule && *join_rule == JoinRule::KnockRestricted);
    let invite_only = *join_rule == JoinRule::Invite
        || (room_version.knock_join_rule && *join_rule == JoinRule::Knock)
        || (room_version.knock_restricted_join_rule && *join_rule == JoinRule::KnockRestricted);

    if *join_rule == JoinRule::Public {
        Ok(())
    } else if restricted {
        if caller_in_or_invited {
            return Ok(());
        }
        let Some(authoriser) = event.content().get(AUTHORISING_USER).and_then(Value::as_str) else {
            return Err(AuthError::forbidden("Join event is missing authorising user."));
        };
        check_joined_room(authoriser, event.room_id().as_str(), auth_events)?;
        if get_user_power_level(authoriser, auth_events) < invite_level {
            return Err(AuthError::forbidden("Join event authorised by invalid server."));
        }
        Ok(())
    } else if invite_only {
        if !caller_in_or_invited {
            return Err(AuthError::forbidden("You are not invited to this room."));
        }
        Ok(())
    } else {
        Err(AuthError::forbidden("You are not allowed to join this room"))
    }
}
