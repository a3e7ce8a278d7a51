//! State-independent event validation.
//!
//! Two gates run before any authorization rule:
//!
//! 1. [`validate_sizes`]: byte limits on identifiers and on the whole event.
//! 2. [`validate_signatures`]: the servers that must have signed the event
//!    have a signature present. Whether those signatures verify is a separate
//!    question answered by [`verify_event_signatures`] through a
//!    [`SignatureVerifier`].
//!
//! A failure at either gate is final for that event instance.

use serde_json::Value;

use crate::canonical::canonical_json;
use crate::content::{Membership, AUTHORISING_USER};
use crate::crypto::SignatureVerifier;
use crate::error::{SignatureError, SizeError, ValidationError};
use crate::event::{Event, EventFields, EventView};
use crate::room_version::RoomVersion;
use crate::types::{event_type, server_name_of};

/// Maximum length in bytes of identifiers, types and state keys.
pub const MAX_ID_LEN: usize = 255;

/// Maximum size in bytes of a canonically encoded event.
pub const MAX_PDU_SIZE: usize = 65536;

fn check_len(field: &'static str, value: &str) -> Result<(), SizeError> {
    if value.len() > MAX_ID_LEN {
        return Err(SizeError::FieldTooLarge {
            field,
            len: value.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

/// Enforce per-field and whole-event byte limits.
pub fn validate_sizes(room_version: &RoomVersion, event: &Event) -> Result<(), SizeError> {
    check_len("sender", event.sender().as_str())?;
    check_len("room_id", event.room_id().as_str())?;
    if let Some(state_key) = event.state_key() {
        check_len("state_key", state_key)?;
    }
    check_len("type", event.event_type())?;
    check_len("event_id", event.event_id().as_str())?;

    let encoded = canonical_json(&Value::Object(event.pdu_json(room_version)))
        .map_err(|e| SizeError::Unencodable(e.to_string()))?;
    if encoded.len() > MAX_PDU_SIZE {
        return Err(SizeError::EventTooLarge {
            len: encoded.len(),
            max: MAX_PDU_SIZE,
        });
    }
    Ok(())
}

/// Whether this is an invite carrying a third-party invite block.
fn is_third_party_invite(event: &Event) -> bool {
    event.event_type() == event_type::MEMBER
        && event.membership() == Membership::Invite
        && event.content().contains_key("third_party_invite")
}

/// The authorising user's server for a restricted join, if this is one.
fn authorising_server(room_version: &RoomVersion, event: &Event) -> Result<Option<String>, SignatureError> {
    if !room_version.restricted_join_rule
        || event.event_type() != event_type::MEMBER
        || event.membership() != Membership::Join
    {
        return Ok(None);
    }
    match event.content().get(AUTHORISING_USER) {
        None => Ok(None),
        Some(Value::String(user)) => server_name_of(user)
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| SignatureError::MalformedId(user.clone())),
        Some(other) => Err(SignatureError::MalformedId(other.to_string())),
    }
}

/// Every server that must have signed this event.
pub fn required_signers(room_version: &RoomVersion, event: &Event) -> Result<Vec<(String, RequiredSigner)>, SignatureError> {
    let mut required = Vec::new();

    if !is_third_party_invite(event) {
        let sender_domain = event
            .sender()
            .server_name()
            .ok_or_else(|| SignatureError::MalformedId(event.sender().to_string()))?;
        required.push((sender_domain.to_string(), RequiredSigner::Sender));
    }

    if room_version.has_legacy_event_ids() {
        let origin = event
            .event_id()
            .server_name()
            .ok_or_else(|| SignatureError::MalformedId(event.event_id().to_string()))?;
        required.push((origin.to_string(), RequiredSigner::Origin));
    }

    if let Some(server) = authorising_server(room_version, event)? {
        required.push((server, RequiredSigner::Authoriser));
    }

    Ok(required)
}

/// Why a server's signature is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredSigner {
    Sender,
    Origin,
    Authoriser,
}

impl RequiredSigner {
    fn missing(self, domain: String) -> SignatureError {
        match self {
            RequiredSigner::Sender => SignatureError::NotSignedBySender(domain),
            RequiredSigner::Origin => SignatureError::NotSignedByOrigin(domain),
            RequiredSigner::Authoriser => SignatureError::NotSignedByAuthoriser(domain),
        }
    }
}

/// Check that every required server has a signature present.
///
/// Does not verify signatures cryptographically.
pub fn validate_signatures(room_version: &RoomVersion, event: &Event) -> Result<(), SignatureError> {
    for (domain, why) in required_signers(room_version, event)? {
        let present = event
            .signatures()
            .get(&domain)
            .map_or(false, |sigs| !sigs.is_empty());
        if !present {
            return Err(why.missing(domain));
        }
    }
    Ok(())
}

/// Verify every required signature with the given verifier.
///
/// For each required server at least one `ed25519:` signature must verify
/// over the event's signing bytes.
pub fn verify_event_signatures(
    room_version: &RoomVersion,
    event: &Event,
    verifier: &dyn SignatureVerifier,
) -> Result<(), SignatureError> {
    let signed_bytes = event
        .signing_bytes(room_version)
        .map_err(|e| SignatureError::MalformedId(e.to_string()))?;

    for (domain, why) in required_signers(room_version, event)? {
        let Some(sigs) = event.signatures().get(&domain) else {
            return Err(why.missing(domain));
        };
        let mut last_error = why.missing(domain.clone());
        let mut verified = false;
        for (key_id, signature) in sigs.iter().filter(|(k, _)| k.starts_with("ed25519:")) {
            if verifier.verify_signature(&domain, key_id, &signed_bytes, signature) {
                verified = true;
                break;
            }
            last_error = if verifier.knows_server(&domain) {
                SignatureError::Invalid {
                    server: domain.clone(),
                    key_id: key_id.clone(),
                }
            } else {
                SignatureError::UnknownKey {
                    server: domain.clone(),
                    key_id: key_id.clone(),
                }
            };
        }
        if !verified {
            return Err(last_error);
        }
    }
    Ok(())
}

/// All state-independent checks an event must pass for its room version:
/// size limits, then signature presence.
pub fn validate_event_for_room_version(room_version: &RoomVersion, event: &Event) -> Result<(), ValidationError> {
    validate_sizes(room_version, event)?;
    validate_signatures(room_version, event)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyRing, ServerKeypair};
    use crate::event::EventBuilder;
    use crate::types::{RoomId, UserId};
    use serde_json::json;

    fn member(rv: &RoomVersion, sender: &str, content: Value, key: &ServerKeypair) -> Event {
        EventBuilder::new(
            RoomId::parse("!r:a.org").unwrap(),
            UserId::parse(sender).unwrap(),
            event_type::MEMBER,
        )
        .state_key(sender)
        .content(content)
        .depth(3)
        .build(rv, key)
        .unwrap()
    }

    #[test]
    fn test_sizes_reject_long_type() {
        let key = ServerKeypair::derive("a.org");
        let event = EventBuilder::new(
            RoomId::parse("!r:a.org").unwrap(),
            UserId::parse("@u:a.org").unwrap(),
            "x".repeat(256),
        )
        .build(&RoomVersion::V10, &key)
        .unwrap();
        assert!(matches!(
            validate_sizes(&RoomVersion::V10, &event),
            Err(SizeError::FieldTooLarge { field: "type", .. })
        ));
    }

    #[test]
    fn test_sizes_reject_huge_event() {
        let key = ServerKeypair::derive("a.org");
        let event = EventBuilder::new(
            RoomId::parse("!r:a.org").unwrap(),
            UserId::parse("@u:a.org").unwrap(),
            "m.room.message",
        )
        .content(json!({"body": "x".repeat(MAX_PDU_SIZE)}))
        .build(&RoomVersion::V10, &key)
        .unwrap();
        assert!(matches!(
            validate_sizes(&RoomVersion::V10, &event),
            Err(SizeError::EventTooLarge { .. })
        ));
    }

    #[test]
    fn test_sender_signature_required() {
        let wrong_key = ServerKeypair::derive("b.org");
        let event = member(&RoomVersion::V10, "@u:a.org", json!({"membership": "join"}), &wrong_key);
        assert_eq!(
            validate_signatures(&RoomVersion::V10, &event),
            Err(SignatureError::NotSignedBySender("a.org".into()))
        );
    }

    #[test]
    fn test_third_party_invite_skips_sender_signature() {
        let other = ServerKeypair::derive("b.org");
        let event = member(
            &RoomVersion::V10,
            "@u:a.org",
            json!({"membership": "invite", "third_party_invite": {"signed": {}}}),
            &other,
        );
        assert!(validate_signatures(&RoomVersion::V10, &event).is_ok());
    }

    #[test]
    fn test_authorising_server_must_sign_restricted_join() {
        let key = ServerKeypair::derive("a.org");
        let content = json!({"membership": "join", AUTHORISING_USER: "@c:c.org"});
        let event = member(&RoomVersion::V8, "@u:a.org", content.clone(), &key);
        assert_eq!(
            validate_signatures(&RoomVersion::V8, &event),
            Err(SignatureError::NotSignedByAuthoriser("c.org".into()))
        );

        // Not enforced before restricted joins exist.
        let event = member(&RoomVersion::V7, "@u:a.org", content, &key);
        assert!(validate_signatures(&RoomVersion::V7, &event).is_ok());
    }

    #[test]
    fn test_legacy_origin_signature_required() {
        let key = ServerKeypair::derive("a.org");
        let event = member(&RoomVersion::V1, "@u:a.org", json!({"membership": "join"}), &key);
        assert!(validate_signatures(&RoomVersion::V1, &event).is_ok());

        // Origin b.org (from the event ID) never signed; only the sender did.
        let foreign = ServerKeypair::derive("b.org");
        let signed_by_origin =
            member(&RoomVersion::V1, "@u:a.org", json!({"membership": "join"}), &foreign);
        let mut pdu = signed_by_origin.pdu_json(&RoomVersion::V1);
        pdu.insert("signatures".into(), json!({"a.org": {"ed25519:auto": "sig"}}));
        let event = Event::from_pdu_json(&RoomVersion::V1, Value::Object(pdu)).unwrap();
        assert_eq!(
            validate_signatures(&RoomVersion::V1, &event),
            Err(SignatureError::NotSignedByOrigin("b.org".into()))
        );
    }

    #[test]
    fn test_verify_event_signatures() {
        let key = ServerKeypair::derive("a.org");
        let event = member(&RoomVersion::V10, "@u:a.org", json!({"membership": "join"}), &key);

        let mut ring = KeyRing::new();
        assert!(matches!(
            verify_event_signatures(&RoomVersion::V10, &event, &ring),
            Err(SignatureError::UnknownKey { .. })
        ));

        ring.add_server(&key);
        assert!(verify_event_signatures(&RoomVersion::V10, &event, &ring).is_ok());

        let forged = event.with_signature("a.org", "ed25519:auto", "AAAA".into());
        assert!(matches!(
            verify_event_signatures(&RoomVersion::V10, &forged, &ring),
            Err(SignatureError::Invalid { .. })
        ));
    }
}
