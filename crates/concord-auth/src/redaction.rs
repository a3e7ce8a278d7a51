//! Redaction authorization.
//!
//! Moderators at or above the `redact` level may redact anything. Anyone
//! else may only redact events from their own server, which for hash-based
//! event IDs cannot be known until the target event is available.

use concord_core::{server_name_of, AuthError, EventFields, EventView, RoomVersion};

use crate::power_levels::{get_named_level, get_user_power_level};
use crate::rules::{AuthEventMap, AuthOutcome};

/// Check a redaction event against the auth events.
pub fn check_redaction<E, A>(
    room_version: &RoomVersion,
    event: &E,
    auth_events: &AuthEventMap<'_, A>,
) -> Result<AuthOutcome, AuthError>
where
    E: EventView + ?Sized,
    A: EventView,
{
    let user_level = get_user_power_level(event.sender().as_str(), auth_events);
    let redact_level = get_named_level(auth_events, "redact", 50);
    if user_level >= redact_level {
        return Ok(AuthOutcome::Accept);
    }

    if !room_version.has_legacy_event_ids() {
        return Ok(AuthOutcome::NeedsRecheck);
    }

    let Some(redacts) = event.redacts() else {
        return Ok(AuthOutcome::Accept);
    };
    let redacter_domain = event.event_id().server_name();
    if redacter_domain.is_some() && redacter_domain == redacts.server_name() {
        return Ok(AuthOutcome::Accept);
    }

    Err(AuthError::forbidden("You don't have permission to redact events"))
}

/// The deferred half of a redaction check, once the target is known.
///
/// A redaction that was accepted with [`AuthOutcome::NeedsRecheck`] only
/// applies to a target sent from the redaction sender's own server.
pub fn redaction_allowed_against_target<R, T>(redaction: &R, target: &T) -> bool
where
    R: EventFields + ?Sized,
    T: EventFields + ?Sized,
{
    let redacter = server_name_of(redaction.sender().as_str());
    redacter.is_some() && redacter == server_name_of(target.sender().as_str())
}
