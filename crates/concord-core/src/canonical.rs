//! Canonical JSON, redaction, and reference hashing.
//!
//! Canonical JSON is the compact encoding with object keys sorted by
//! codepoint and non-ASCII characters emitted as UTF-8. Every server must
//! produce identical bytes for the same event, so hashes, event IDs and
//! signatures are all computed over this encoding.
//!
//! - Room versions with `strict_canonicaljson` reject floats and integers
//!   outside `[-(2^53 - 1), 2^53 - 1]`.
//! - Event IDs for hash-based formats are the Blake3 hash of the pruned event
//!   with `signatures` and `unsigned` removed.

use serde_json::Value;

use crate::content::{JsonObject, AUTHORISING_USER};
use crate::crypto::{encode_base64, encode_base64_url, Blake3Hash};
use crate::error::CoreError;
use crate::room_version::{EventFormatVersion, RoomVersion};
use crate::types::event_type;

/// Largest integer representable without loss in every JSON implementation.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Top-level keys kept by the redaction algorithm.
const REDACTION_ALLOWED_KEYS: &[&str] = &[
    "event_id",
    "sender",
    "room_id",
    "hashes",
    "signatures",
    "content",
    "type",
    "state_key",
    "depth",
    "prev_events",
    "prev_state",
    "auth_events",
    "origin",
    "origin_server_ts",
    "membership",
];

/// Encode a JSON value canonically, allowing any number.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CoreError> {
    // serde_json's default map is ordered by key, which gives canonical order.
    serde_json::to_vec(value).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Encode canonically, rejecting floats and out-of-range integers.
pub fn canonical_json_strict(value: &Value) -> Result<Vec<u8>, CoreError> {
    check_strict_numbers(value)?;
    canonical_json(value)
}

/// Encode canonically with the number rules of the given room version.
pub fn canonical_json_for(room_version: &RoomVersion, value: &Value) -> Result<Vec<u8>, CoreError> {
    if room_version.strict_canonicaljson {
        canonical_json_strict(value)
    } else {
        canonical_json(value)
    }
}

fn check_strict_numbers(value: &Value) -> Result<(), CoreError> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) => Ok(()),
            Some(i) => Err(CoreError::InvalidCanonicalJson(format!(
                "integer out of range: {}",
                i
            ))),
            None => Err(CoreError::InvalidCanonicalJson(format!(
                "non-integer number: {}",
                n
            ))),
        },
        Value::Array(items) => items.iter().try_for_each(check_strict_numbers),
        Value::Object(map) => map.values().try_for_each(check_strict_numbers),
        _ => Ok(()),
    }
}

/// Apply the redaction algorithm to an event in JSON form.
///
/// Keeps only the protocol-level top-level keys and, inside `content`, only
/// the fields the authorization rules depend on for the event's type.
pub fn prune_event_json(room_version: &RoomVersion, event: &JsonObject) -> JsonObject {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    let content = event.get("content").and_then(Value::as_object);

    let mut kept_content = JsonObject::new();
    let mut keep = |fields: &[&str]| {
        if let Some(content) = content {
            for field in fields {
                if let Some(v) = content.get(*field) {
                    kept_content.insert((*field).to_string(), v.clone());
                }
            }
        }
    };

    match event_type {
        event_type::MEMBER => {
            keep(&["membership"]);
            if room_version.restricted_join_rule_redactions {
                keep(&[AUTHORISING_USER]);
            }
        }
        event_type::CREATE => keep(&["creator"]),
        event_type::JOIN_RULES => {
            keep(&["join_rule"]);
            if room_version.restricted_join_rule {
                keep(&["allow"]);
            }
        }
        event_type::POWER_LEVELS => {
            keep(&[
                "users",
                "users_default",
                "events",
                "events_default",
                "state_default",
                "ban",
                "kick",
                "redact",
            ]);
            if room_version.msc2716_historical {
                keep(&["historical"]);
            }
        }
        event_type::ALIASES if room_version.special_case_aliases_auth => keep(&["aliases"]),
        event_type::HISTORY_VISIBILITY => keep(&["history_visibility"]),
        event_type::HISTORICAL_INSERTION if room_version.msc2716_redactions => {
            keep(&["next_batch_id"])
        }
        event_type::HISTORICAL_BATCH if room_version.msc2716_redactions => keep(&["batch_id"]),
        event_type::HISTORICAL_MARKER if room_version.msc2716_redactions => {
            keep(&["insertion_event_reference"])
        }
        _ => {}
    }

    let mut pruned: JsonObject = event
        .iter()
        .filter(|(k, _)| REDACTION_ALLOWED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pruned.insert("content".into(), Value::Object(kept_content));
    pruned
}

/// Bytes covered by server signatures: the pruned event without
/// `signatures` and `unsigned`.
pub fn signing_bytes(room_version: &RoomVersion, event: &JsonObject) -> Result<Vec<u8>, CoreError> {
    let mut pruned = prune_event_json(room_version, event);
    pruned.remove("signatures");
    pruned.remove("unsigned");
    canonical_json_for(room_version, &Value::Object(pruned))
}

/// The reference hash of an event.
pub fn reference_hash(room_version: &RoomVersion, event: &JsonObject) -> Result<Blake3Hash, CoreError> {
    let mut without_id = event.clone();
    without_id.remove("event_id");
    Ok(Blake3Hash::hash(&signing_bytes(room_version, &without_id)?))
}

/// Derive an event ID from a reference hash for hash-based formats.
///
/// Returns `None` for the legacy format, where the sender picks the ID.
pub fn event_id_from_hash(format: EventFormatVersion, hash: &Blake3Hash) -> Option<String> {
    match format {
        EventFormatVersion::Legacy => None,
        EventFormatVersion::ReferenceHash => Some(format!("${}", encode_base64(hash.as_bytes()))),
        EventFormatVersion::UrlSafeReferenceHash => {
            Some(format!("${}", encode_base64_url(hash.as_bytes())))
        }
    }
}

/// Hash of the full (unpruned) event without its ID, stored under
/// `hashes.blake3`.
///
/// Lets receivers detect content that was altered without invalidating the
/// signature, which only covers the pruned form.
pub fn content_hash(room_version: &RoomVersion, event: &JsonObject) -> Result<Blake3Hash, CoreError> {
    let mut stripped = event.clone();
    stripped.remove("event_id");
    stripped.remove("unsigned");
    stripped.remove("signatures");
    stripped.remove("hashes");
    let bytes = canonical_json_for(room_version, &Value::Object(stripped))?;
    Ok(Blake3Hash::hash(&bytes))
}
