//! # Concord Auth
//!
//! The authorization rules for room events.
//!
//! ## Overview
//!
//! Every event is judged against a set of *auth events*: the create event,
//! the power levels, the join rules and the relevant memberships at the
//! point the event is inserted. The rules are pure functions of the room
//! version, the event and those auth events, so every server reaches the same
//! verdict.
//!
//! ## Entry Points
//!
//! - [`auth_types_for_event`]: which state slots an event is authorized against
//! - [`check_state_independent_auth_rules`]: checks over the event's own
//!   claimed auth events
//! - [`check_auth_rules_for_event`]: the full rule set
//!
//! ## Outcomes
//!
//! A passing check returns an [`AuthOutcome`]. Redactions by non-moderators
//! in rooms with hash-based event IDs come back as
//! [`AuthOutcome::NeedsRecheck`]: they are allowed in, and applied only
//! once [`redaction_allowed_against_target`] confirms the target came from
//! the same server.
//!
//! Failures are [`AuthError`](concord_core::AuthError)s. A 500 code means the
//! caller broke a precondition (cross-room or rejected auth events).

pub mod auth_types;
pub mod membership;
pub mod power_levels;
pub mod redaction;
pub mod rules;
pub mod third_party_invite;

#[cfg(test)]
pub(crate) mod test_utils;

pub use auth_types::auth_types_for_event;
pub use membership::check_membership_change;
pub use power_levels::{
    check_power_levels, get_named_level, get_send_level, get_user_power_level, power_levels_event,
    validate_power_levels_content,
};
pub use redaction::{check_redaction, redaction_allowed_against_target};
pub use rules::{
    build_auth_event_map, check_auth_rules_for_event, check_auth_rules_with_map,
    check_state_independent_auth_rules, AuthEventMap, AuthOutcome,
};
pub use third_party_invite::verify_third_party_invite;
