//! # Concord Core
//!
//! Pure primitives for Concord: identifiers, room versions, events, and
//! canonical JSON.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over the event data model.
//!
//! ## Key Types
//!
//! - [`Event`] - An immutable, content-addressed room event
//! - [`EventView`] / [`EventFields`] - Read-only views shared by events and builders
//! - [`EventMetadata`] - Mutable local bookkeeping kept beside an event
//! - [`RoomVersion`] - Feature flags for a room version
//! - [`StateMap`] / [`StateDelta`] - Room state and changes to it
//!
//! ## Validation
//!
//! [`validate_event_for_room_version`] runs the size and signature-presence
//! gates. Cryptographic verification goes through a [`SignatureVerifier`].
//!
//! ## Canonicalization
//!
//! Event IDs, content hashes and signatures are computed over canonical JSON.
//! See the [`canonical`] module.

pub mod canonical;
pub mod content;
pub mod crypto;
pub mod error;
pub mod event;
pub mod room_version;
pub mod types;
pub mod validation;

pub use canonical::{canonical_json, canonical_json_for, prune_event_json};
pub use content::{
    parse_power_level, EventContent, JoinRule, JsonObject, Membership, PowerLevelsContent,
    AUTHORISING_USER,
};
pub use crypto::{
    decode_base64, encode_base64, Blake3Hash, Ed25519PublicKey, Ed25519Signature, KeyRing,
    Keypair, ServerKeypair, SignatureVerifier,
};
pub use error::{AuthError, AuthErrorKind, CoreError, SignatureError, SizeError, ValidationError};
pub use event::{
    is_historical_event_type, Event, EventBuilder, EventFields, EventMetadata, EventView,
    Signatures, StoredEvent,
};
pub use room_version::{
    require_room_version, room_version_rules, EventFormatVersion, RoomVersion,
    StateResolutionVersion, DEFAULT_ROOM_VERSION_ID, KNOWN_ROOM_VERSIONS,
};
pub use types::{event_type, server_name_of, EventId, RoomId, StateDelta, StateKey, StateMap, UserId};
pub use validation::{
    validate_event_for_room_version, validate_signatures, validate_sizes,
    verify_event_signatures, MAX_PDU_SIZE,
};
