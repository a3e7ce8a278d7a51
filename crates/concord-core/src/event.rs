//! Events: the immutable unit of room history.
//!
//! An [`Event`] never changes once its ID is computed. Local bookkeeping
//! (outlier, rejection, soft-fail, stream position) lives in a separate
//! [`EventMetadata`] keyed by event ID. Read access goes through two traits:
//!
//! - [`EventFields`]: what is known before an event has an ID (also
//!   implemented by [`EventBuilder`]).
//! - [`EventView`]: the full read-only view of a finished event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{content_hash, event_id_from_hash, reference_hash, signing_bytes};
use crate::content::{EventContent, JsonObject, Membership};
use crate::crypto::{encode_base64, ServerKeypair};
use crate::error::CoreError;
use crate::room_version::RoomVersion;
use crate::types::{event_type, EventId, RoomId, StateKey, UserId};

/// Server name → key ID → base64 signature.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// Name of the content hash entry in `hashes`.
pub const CONTENT_HASH_ALGORITHM: &str = "blake3";

/// Fields available on both finished events and events under construction.
pub trait EventFields {
    fn room_id(&self) -> &RoomId;
    fn sender(&self) -> &UserId;
    fn event_type(&self) -> &str;
    fn state_key(&self) -> Option<&str>;
    fn content(&self) -> &JsonObject;

    fn is_state(&self) -> bool {
        self.state_key().is_some()
    }

    /// The `(type, state_key)` slot this event occupies, for state events.
    fn state_slot(&self) -> Option<StateKey> {
        self.state_key()
            .map(|sk| StateKey::new(self.event_type(), sk))
    }

    /// The membership in a member event's content.
    fn membership(&self) -> Membership {
        Membership::from_content(self.content())
    }

    fn typed_content(&self) -> EventContent {
        EventContent::parse(self.event_type(), self.content())
    }
}

/// Read-only view of a finished event, as the auth rules and state
/// resolution see it.
pub trait EventView: EventFields {
    fn event_id(&self) -> &EventId;
    fn prev_event_ids(&self) -> &[EventId];
    fn auth_event_ids(&self) -> &[EventId];
    fn depth(&self) -> i64;
    fn origin_server_ts(&self) -> i64;
    fn redacts(&self) -> Option<&EventId>;
    fn signatures(&self) -> &Signatures;

    /// Why this event was rejected, if the local server rejected it.
    fn rejected_reason(&self) -> Option<&str> {
        None
    }

    fn is_rejected(&self) -> bool {
        self.rejected_reason().is_some()
    }
}

/// An immutable, content-addressed event.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: EventId,
    room_id: RoomId,
    sender: UserId,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    content: JsonObject,
    prev_events: Vec<EventId>,
    auth_events: Vec<EventId>,
    depth: i64,
    origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redacts: Option<EventId>,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
    #[serde(default)]
    signatures: Signatures,
    /// Top-level keys this implementation does not interpret.
    #[serde(flatten)]
    extra: JsonObject,
}

impl Event {
    /// Parse an event received over federation.
    ///
    /// For hash-based formats the ID is derived from the content and any
    /// `event_id` in the JSON is ignored. Legacy formats require it.
    pub fn from_pdu_json(room_version: &RoomVersion, pdu: Value) -> Result<Self, CoreError> {
        let Value::Object(mut obj) = pdu else {
            return Err(CoreError::MalformedEvent("event is not an object".into()));
        };
        obj.remove("unsigned");
        if !room_version.has_legacy_event_ids() {
            obj.remove("event_id");
            let hash = reference_hash(room_version, &obj)?;
            if let Some(id) = event_id_from_hash(room_version.event_format, &hash) {
                obj.insert("event_id".into(), Value::String(id));
            }
        } else if !obj.contains_key("event_id") {
            return Err(CoreError::MalformedEvent(
                "legacy event format requires event_id".into(),
            ));
        }
        serde_json::from_value(Value::Object(obj))
            .map_err(|e| CoreError::MalformedEvent(e.to_string()))
    }

    /// The event as it is sent over federation.
    pub fn pdu_json(&self, room_version: &RoomVersion) -> JsonObject {
        let mut obj = match serde_json::to_value(self) {
            Ok(Value::Object(obj)) => obj,
            _ => JsonObject::new(),
        };
        if !room_version.has_legacy_event_ids() {
            obj.remove("event_id");
        }
        obj
    }

    /// The redacted form of this event. The ID is unchanged.
    pub fn redacted(&self, room_version: &RoomVersion) -> Result<Self, CoreError> {
        let full = match serde_json::to_value(self)? {
            Value::Object(obj) => obj,
            _ => return Err(CoreError::EncodingError("event is not an object".into())),
        };
        let pruned = crate::canonical::prune_event_json(room_version, &full);
        serde_json::from_value(Value::Object(pruned))
            .map_err(|e| CoreError::MalformedEvent(e.to_string()))
    }

    /// Canonical bytes covered by server signatures.
    pub fn signing_bytes(&self, room_version: &RoomVersion) -> Result<Vec<u8>, CoreError> {
        signing_bytes(room_version, &self.pdu_json(room_version))
    }

    /// Whether `hashes.blake3` matches the event's full content.
    pub fn content_hash_matches(&self, room_version: &RoomVersion) -> Result<bool, CoreError> {
        let Some(claimed) = self.hashes.get(CONTENT_HASH_ALGORITHM) else {
            return Ok(false);
        };
        let actual = content_hash(room_version, &self.pdu_json(room_version))?;
        Ok(*claimed == actual.to_base64())
    }

    pub fn hashes(&self) -> &BTreeMap<String, String> {
        &self.hashes
    }

    /// Top-level keys not interpreted by this implementation.
    pub fn extra(&self) -> &JsonObject {
        &self.extra
    }

    /// A copy carrying one more signature. The ID does not change.
    pub fn with_signature(&self, server_name: &str, key_id: &str, signature: String) -> Self {
        let mut signed = self.clone();
        signed
            .signatures
            .entry(server_name.to_string())
            .or_default()
            .insert(key_id.to_string(), signature);
        signed
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_id", &self.event_id)
            .field("type", &self.event_type)
            .field("state_key", &self.state_key)
            .field("sender", &self.sender)
            .field("depth", &self.depth)
            .finish()
    }
}

impl EventFields for Event {
    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn sender(&self) -> &UserId {
        &self.sender
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    fn content(&self) -> &JsonObject {
        &self.content
    }
}

impl EventView for Event {
    fn event_id(&self) -> &EventId {
        &self.event_id
    }

    fn prev_event_ids(&self) -> &[EventId] {
        &self.prev_events
    }

    fn auth_event_ids(&self) -> &[EventId] {
        &self.auth_events
    }

    fn depth(&self) -> i64 {
        self.depth
    }

    fn origin_server_ts(&self) -> i64 {
        self.origin_server_ts
    }

    fn redacts(&self) -> Option<&EventId> {
        self.redacts.as_ref()
    }

    fn signatures(&self) -> &Signatures {
        &self.signatures
    }
}

macro_rules! delegate_event_view {
    ($ty:ty, $inner:ident => $target:expr, $rejected:expr) => {
        impl EventFields for $ty {
            fn room_id(&self) -> &RoomId {
                let $inner = self;
                $target.room_id()
            }
            fn sender(&self) -> &UserId {
                let $inner = self;
                $target.sender()
            }
            fn event_type(&self) -> &str {
                let $inner = self;
                $target.event_type()
            }
            fn state_key(&self) -> Option<&str> {
                let $inner = self;
                $target.state_key()
            }
            fn content(&self) -> &JsonObject {
                let $inner = self;
                $target.content()
            }
        }

        impl EventView for $ty {
            fn event_id(&self) -> &EventId {
                let $inner = self;
                $target.event_id()
            }
            fn prev_event_ids(&self) -> &[EventId] {
                let $inner = self;
                $target.prev_event_ids()
            }
            fn auth_event_ids(&self) -> &[EventId] {
                let $inner = self;
                $target.auth_event_ids()
            }
            fn depth(&self) -> i64 {
                let $inner = self;
                $target.depth()
            }
            fn origin_server_ts(&self) -> i64 {
                let $inner = self;
                $target.origin_server_ts()
            }
            fn redacts(&self) -> Option<&EventId> {
                let $inner = self;
                $target.redacts()
            }
            fn signatures(&self) -> &Signatures {
                let $inner = self;
                $target.signatures()
            }
            fn rejected_reason(&self) -> Option<&str> {
                let $inner = self;
                $rejected
            }
        }
    };
}

/// Local processing state for an event, kept outside the event itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Fetched only to satisfy auth or state dependencies.
    pub outlier: bool,
    /// Set when the event failed authorization.
    pub rejected_reason: Option<String>,
    /// Passed auth at its own position but not against current state.
    pub soft_failed: bool,
    /// A redaction whose target still has to be compared with its sender.
    pub recheck_redaction: bool,
    /// Local persistence order.
    pub stream_ordering: Option<i64>,
}

impl EventMetadata {
    pub fn outlier() -> Self {
        Self {
            outlier: true,
            ..Self::default()
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            rejected_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// An event together with its local metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event: Arc<Event>,
    pub metadata: EventMetadata,
}

impl StoredEvent {
    pub fn new(event: impl Into<Arc<Event>>, metadata: EventMetadata) -> Self {
        Self {
            event: event.into(),
            metadata,
        }
    }
}

delegate_event_view!(StoredEvent, s => s.event, s.metadata.rejected_reason.as_deref());
delegate_event_view!(Arc<Event>, s => (**s), {
    let _ = s;
    None
});

impl<T: EventFields + ?Sized> EventFields for &T {
    fn room_id(&self) -> &RoomId {
        (**self).room_id()
    }
    fn sender(&self) -> &UserId {
        (**self).sender()
    }
    fn event_type(&self) -> &str {
        (**self).event_type()
    }
    fn state_key(&self) -> Option<&str> {
        (**self).state_key()
    }
    fn content(&self) -> &JsonObject {
        (**self).content()
    }
}

impl<T: EventView + ?Sized> EventView for &T {
    fn event_id(&self) -> &EventId {
        (**self).event_id()
    }
    fn prev_event_ids(&self) -> &[EventId] {
        (**self).prev_event_ids()
    }
    fn auth_event_ids(&self) -> &[EventId] {
        (**self).auth_event_ids()
    }
    fn depth(&self) -> i64 {
        (**self).depth()
    }
    fn origin_server_ts(&self) -> i64 {
        (**self).origin_server_ts()
    }
    fn redacts(&self) -> Option<&EventId> {
        (**self).redacts()
    }
    fn signatures(&self) -> &Signatures {
        (**self).signatures()
    }
    fn rejected_reason(&self) -> Option<&str> {
        (**self).rejected_reason()
    }
}

/// Builds and signs a new event.
///
/// ```rust,ignore
/// let event = EventBuilder::new(room_id, sender, "m.room.message")
///     .content(json!({"body": "hi"}))
///     .prev_events(vec![prev])
///     .auth_events(auth)
///     .depth(4)
///     .build(&RoomVersion::V10, &server_key)?;
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    room_id: RoomId,
    sender: UserId,
    event_type: String,
    state_key: Option<String>,
    content: JsonObject,
    prev_events: Vec<EventId>,
    auth_events: Vec<EventId>,
    depth: i64,
    origin_server_ts: i64,
    redacts: Option<EventId>,
}

impl EventBuilder {
    pub fn new(room_id: RoomId, sender: UserId, event_type: impl Into<String>) -> Self {
        Self {
            room_id,
            sender,
            event_type: event_type.into(),
            state_key: None,
            content: JsonObject::new(),
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            origin_server_ts: 0,
            redacts: None,
        }
    }

    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    /// Set the content. Non-object values are replaced by an empty object.
    pub fn content(mut self, content: Value) -> Self {
        self.content = match content {
            Value::Object(obj) => obj,
            _ => JsonObject::new(),
        };
        self
    }

    pub fn prev_events(mut self, prev_events: Vec<EventId>) -> Self {
        self.prev_events = prev_events;
        self
    }

    pub fn auth_events(mut self, auth_events: Vec<EventId>) -> Self {
        self.auth_events = auth_events;
        self
    }

    pub fn depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }

    pub fn origin_server_ts(mut self, ts: i64) -> Self {
        self.origin_server_ts = ts;
        self
    }

    pub fn redacts(mut self, target: EventId) -> Self {
        self.redacts = Some(target);
        self
    }

    /// Hash, derive the ID, and sign with the given server key.
    pub fn build(self, room_version: &RoomVersion, signer: &ServerKeypair) -> Result<Event, CoreError> {
        let mut event = Event {
            event_id: EventId::parse("$pending")?,
            room_id: self.room_id,
            sender: self.sender,
            event_type: self.event_type,
            state_key: self.state_key,
            content: self.content,
            prev_events: self.prev_events,
            auth_events: self.auth_events,
            depth: self.depth,
            origin_server_ts: self.origin_server_ts,
            redacts: self.redacts,
            hashes: BTreeMap::new(),
            signatures: Signatures::new(),
            extra: JsonObject::new(),
        };

        let hash = content_hash(room_version, &event.pdu_json(room_version))?;
        event
            .hashes
            .insert(CONTENT_HASH_ALGORITHM.into(), hash.to_base64());

        let mut pdu = event.pdu_json(room_version);
        pdu.remove("event_id");
        let reference = reference_hash(room_version, &pdu)?;
        event.event_id = match event_id_from_hash(room_version.event_format, &reference) {
            Some(id) => EventId::parse(id)?,
            // Legacy IDs are chosen by the origin; derive one deterministically.
            None => EventId::parse(format!(
                "${}:{}",
                &reference.to_base64().replace(['+', '/'], "_")[..18],
                signer.server_name
            ))?,
        };

        let signature = signer.keypair.sign(&event.signing_bytes(room_version)?);
        Ok(event.with_signature(&signer.server_name, &signer.key_id, encode_base64(&signature.0)))
    }
}

impl EventFields for EventBuilder {
    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn sender(&self) -> &UserId {
        &self.sender
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    fn content(&self) -> &JsonObject {
        &self.content
    }
}

/// True for the event types gated behind the historical room-version flag.
pub fn is_historical_event_type(t: &str) -> bool {
    matches!(
        t,
        event_type::HISTORICAL_INSERTION | event_type::HISTORICAL_BATCH | event_type::HISTORICAL_MARKER
    )
}
