//! Room versions and their feature flags.
//!
//! A room's version is fixed by its create event and never changes for the
//! lifetime of the room. Every rule that differs between versions reads a
//! flag from [`RoomVersion`] rather than comparing version strings.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How event IDs are derived and encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFormatVersion {
    /// `$localpart:origin`, chosen by the sending server.
    Legacy,
    /// `$` + standard base64 reference hash.
    ReferenceHash,
    /// `$` + URL-safe base64 reference hash.
    UrlSafeReferenceHash,
}

/// Which state resolution algorithm the room uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateResolutionVersion {
    V1,
    V2,
}

/// Whether a version is fit for general use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomDisposition {
    Stable,
    Unstable,
}

/// Feature flags for one room version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomVersion {
    pub identifier: &'static str,
    pub disposition: RoomDisposition,
    pub event_format: EventFormatVersion,
    pub state_res: StateResolutionVersion,
    /// Signing keys must be valid at the event's timestamp.
    pub enforce_key_validity: bool,
    /// `m.room.aliases` has its own auth rule and survives redaction.
    pub special_case_aliases_auth: bool,
    /// Floats and out-of-range integers are rejected in event JSON.
    pub strict_canonicaljson: bool,
    /// Changes to `notifications` power levels are ceiling-checked.
    pub limit_notifications_power_levels: bool,
    /// `knock` membership and join rule.
    pub knock_join_rule: bool,
    /// `restricted` join rule with an authorising user.
    pub restricted_join_rule: bool,
    /// The authorising user field survives redaction.
    pub restricted_join_rule_redactions: bool,
    /// `knock_restricted` join rule.
    pub knock_restricted_join_rule: bool,
    /// Power level values must be JSON integers.
    pub enforce_int_power_levels: bool,
    /// Historical batch events and their `historical` power level.
    pub msc2716_historical: bool,
    /// Historical event fields survive redaction.
    pub msc2716_redactions: bool,
}

impl RoomVersion {
    pub const V1: RoomVersion = RoomVersion {
        identifier: "1",
        disposition: RoomDisposition::Stable,
        event_format: EventFormatVersion::Legacy,
        state_res: StateResolutionVersion::V1,
        enforce_key_validity: false,
        special_case_aliases_auth: true,
        strict_canonicaljson: false,
        limit_notifications_power_levels: false,
        knock_join_rule: false,
        restricted_join_rule: false,
        restricted_join_rule_redactions: false,
        knock_restricted_join_rule: false,
        enforce_int_power_levels: false,
        msc2716_historical: false,
        msc2716_redactions: false,
    };

    pub const V2: RoomVersion = RoomVersion {
        identifier: "2",
        state_res: StateResolutionVersion::V2,
        ..Self::V1
    };

    pub const V3: RoomVersion = RoomVersion {
        identifier: "3",
        event_format: EventFormatVersion::ReferenceHash,
        ..Self::V2
    };

    pub const V4: RoomVersion = RoomVersion {
        identifier: "4",
        event_format: EventFormatVersion::UrlSafeReferenceHash,
        ..Self::V3
    };

    pub const V5: RoomVersion = RoomVersion {
        identifier: "5",
        enforce_key_validity: true,
        ..Self::V4
    };

    pub const V6: RoomVersion = RoomVersion {
        identifier: "6",
        special_case_aliases_auth: false,
        strict_canonicaljson: true,
        limit_notifications_power_levels: true,
        ..Self::V5
    };

    pub const V7: RoomVersion = RoomVersion {
        identifier: "7",
        knock_join_rule: true,
        ..Self::V6
    };

    pub const V8: RoomVersion = RoomVersion {
        identifier: "8",
        restricted_join_rule: true,
        ..Self::V7
    };

    pub const V9: RoomVersion = RoomVersion {
        identifier: "9",
        restricted_join_rule_redactions: true,
        ..Self::V8
    };

    pub const V10: RoomVersion = RoomVersion {
        identifier: "10",
        knock_restricted_join_rule: true,
        enforce_int_power_levels: true,
        ..Self::V9
    };

    pub const MSC2716V3: RoomVersion = RoomVersion {
        identifier: "org.matrix.msc2716v3",
        disposition: RoomDisposition::Unstable,
        msc2716_historical: true,
        msc2716_redactions: true,
        ..Self::V9
    };

    /// Whether event IDs carry the origin server's name.
    pub fn has_legacy_event_ids(&self) -> bool {
        self.event_format == EventFormatVersion::Legacy
    }
}

/// Every room version this implementation understands.
pub static KNOWN_ROOM_VERSIONS: [&RoomVersion; 11] = [
    &RoomVersion::V1,
    &RoomVersion::V2,
    &RoomVersion::V3,
    &RoomVersion::V4,
    &RoomVersion::V5,
    &RoomVersion::V6,
    &RoomVersion::V7,
    &RoomVersion::V8,
    &RoomVersion::V9,
    &RoomVersion::V10,
    &RoomVersion::MSC2716V3,
];

/// Version assumed when a create event does not name one.
pub const DEFAULT_ROOM_VERSION_ID: &str = "1";

/// Look up a room version by identifier.
pub fn room_version_rules(identifier: &str) -> Option<&'static RoomVersion> {
    KNOWN_ROOM_VERSIONS
        .iter()
        .copied()
        .find(|v| v.identifier == identifier)
}

/// Like [`room_version_rules`], failing with [`CoreError::UnknownRoomVersion`].
pub fn require_room_version(identifier: &str) -> Result<&'static RoomVersion, CoreError> {
    room_version_rules(identifier).ok_or_else(|| CoreError::UnknownRoomVersion(identifier.into()))
}
