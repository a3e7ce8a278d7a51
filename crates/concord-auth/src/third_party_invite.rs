//! Verification of invites issued through a third-party identifier.
//!
//! An identity server signs a `signed` block binding a user ID to the token
//! of an earlier `m.room.third_party_invite` event. The invite is valid when
//! that signature verifies against one of the public keys the original
//! invite published.

use serde_json::Value;
use tracing::debug;

use concord_core::{
    canonical_json, event_type, EventContent, EventFields, EventView, Ed25519PublicKey,
    Ed25519Signature, JsonObject, StateKey,
};

use crate::rules::AuthEventMap;

/// Verify one identity-server signature over the `signed` block.
fn verify_signed_json(signed: &JsonObject, signature: &str, public_key: &str) -> bool {
    let mut unsigned = signed.clone();
    unsigned.remove("signatures");
    unsigned.remove("unsigned");
    let Ok(bytes) = canonical_json(&Value::Object(unsigned)) else {
        return false;
    };
    let (Ok(key), Ok(sig)) = (
        Ed25519PublicKey::from_base64(public_key),
        Ed25519Signature::from_base64(signature),
    ) else {
        return false;
    };
    key.verify(&bytes, &sig).is_ok()
}

/// Try every `ed25519:` signature in the block against one public key.
///
/// Mirrors the all-or-nothing handling of a key: the first signature that
/// fails to verify abandons this key.
fn verify_with_key(signed: &JsonObject, signatures: &JsonObject, public_key: &str) -> bool {
    for block in signatures.values() {
        let Some(block) = block.as_object() else {
            return false;
        };
        for (key_name, signature) in block {
            if !key_name.starts_with("ed25519:") {
                continue;
            }
            let Some(signature) = signature.as_str() else {
                return false;
            };
            return verify_signed_json(signed, signature, public_key);
        }
    }
    false
}

/// Whether an invite event's `third_party_invite` block is valid.
///
/// Requires `signed.mxid`, `signed.token` and `signed.signatures`; the
/// matching third-party invite event must be in the auth events, sent by the
/// same sender, and `signed.mxid` must be the invited user.
pub fn verify_third_party_invite<E, A>(event: &E, auth_events: &AuthEventMap<'_, A>) -> bool
where
    E: EventView + ?Sized,
    A: EventView,
{
    let Some(signed) = event
        .content()
        .get("third_party_invite")
        .and_then(Value::as_object)
        .and_then(|tpi| tpi.get("signed"))
        .and_then(Value::as_object)
    else {
        return false;
    };

    let (Some(mxid), Some(token), Some(signatures)) = (
        signed.get("mxid").and_then(Value::as_str),
        signed.get("token").and_then(Value::as_str),
        signed.get("signatures").and_then(Value::as_object),
    ) else {
        return false;
    };

    let Some(invite_event) = auth_events.get(&StateKey::new(event_type::THIRD_PARTY_INVITE, token)) else {
        debug!(token, "no third party invite for token");
        return false;
    };
    if invite_event.sender() != event.sender() {
        return false;
    }
    if Some(mxid) != event.state_key() {
        return false;
    }

    let EventContent::ThirdPartyInvite(content) = invite_event.typed_content() else {
        return false;
    };
    content
        .public_keys
        .iter()
        .any(|public_key| verify_with_key(signed, signatures, public_key))
}
