//! Typed views over event content.
//!
//! Content is stored as raw JSON on the event so that hashing and signing
//! see exactly what the sender produced. The types here parse only the
//! fields the authorization rules inspect, leniently, and fall back to
//! [`EventContent::Other`] for unrecognised event types.

use serde_json::Value;

use crate::types::event_type;

/// A JSON object.
pub type JsonObject = serde_json::Map<String, Value>;

/// Content field naming the user whose server authorised a restricted join.
pub const AUTHORISING_USER: &str = "join_authorised_via_users_server";

/// Create-event content field controlling federation.
pub const FEDERATE: &str = "m.federate";

/// Parse a power level the way the reference servers coerce values:
/// integers as-is, floats truncated, booleans as 0/1, and strings holding an
/// optionally signed decimal integer surrounded by whitespace.
pub fn parse_power_level(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let trimmed = s.trim();
            let digits = trimmed
                .strip_prefix('-')
                .or_else(|| trimmed.strip_prefix('+'))
                .unwrap_or(trimmed);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            trimmed.parse().ok()
        }
        _ => None,
    }
}

/// Strict variant: only JSON integers count.
pub fn parse_power_level_strict(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// A membership state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    /// Anything else, kept verbatim. An empty string means the field was absent.
    Unknown(String),
}

impl Membership {
    pub fn parse(s: &str) -> Self {
        match s {
            "join" => Membership::Join,
            "invite" => Membership::Invite,
            "leave" => Membership::Leave,
            "ban" => Membership::Ban,
            "knock" => Membership::Knock,
            other => Membership::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Membership::Join => "join",
            Membership::Invite => "invite",
            Membership::Leave => "leave",
            Membership::Ban => "ban",
            Membership::Knock => "knock",
            Membership::Unknown(s) => s,
        }
    }

    /// Read the `membership` field of a content object.
    pub fn from_content(content: &JsonObject) -> Self {
        match content.get("membership") {
            Some(Value::String(s)) => Membership::parse(s),
            Some(other) => Membership::Unknown(other.to_string()),
            None => Membership::Unknown(String::new()),
        }
    }
}

/// A room's join rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Restricted,
    KnockRestricted,
    Private,
    Other(String),
}

impl JoinRule {
    pub fn parse(s: &str) -> Self {
        match s {
            "public" => JoinRule::Public,
            "invite" => JoinRule::Invite,
            "knock" => JoinRule::Knock,
            "restricted" => JoinRule::Restricted,
            "knock_restricted" => JoinRule::KnockRestricted,
            "private" => JoinRule::Private,
            other => JoinRule::Other(other.to_string()),
        }
    }
}

/// `m.room.create` content.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateContent {
    pub creator: Option<String>,
    /// `None` when absent; the default version applies.
    pub room_version: Option<Value>,
    /// Only a literal `true` (or absence) allows federation.
    pub federate: bool,
}

/// `m.room.member` content.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberContent {
    pub membership: Membership,
    pub third_party_invite: Option<Value>,
    pub authorising_user: Option<Value>,
}

/// `m.room.join_rules` content.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRulesContent {
    pub join_rule: JoinRule,
}

/// `m.room.redaction` content (the target lives on the event itself).
#[derive(Debug, Clone, PartialEq)]
pub struct RedactionContent {
    pub reason: Option<String>,
}

/// `m.room.third_party_invite` content.
#[derive(Debug, Clone, PartialEq)]
pub struct ThirdPartyInviteContent {
    /// Every published public key, the singular field first.
    pub public_keys: Vec<String>,
}

/// `m.room.aliases` content.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasesContent {
    pub aliases: Vec<String>,
}

/// Read-only accessors over `m.room.power_levels` content.
#[derive(Debug, Clone, Copy)]
pub struct PowerLevelsContent<'a> {
    raw: &'a JsonObject,
}

impl<'a> PowerLevelsContent<'a> {
    pub fn new(raw: &'a JsonObject) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &'a JsonObject {
        self.raw
    }

    /// A named scalar level (`ban`, `kick`, `invite`, ...), if present and parseable.
    pub fn named(&self, name: &str) -> Option<i64> {
        self.raw.get(name).and_then(parse_power_level)
    }

    /// A sub-map such as `users`, `events` or `notifications`.
    pub fn section(&self, name: &str) -> Option<&'a JsonObject> {
        self.raw.get(name).and_then(Value::as_object)
    }

    /// Level for a user, falling back to `users_default`, then 0.
    pub fn user_level(&self, user_id: &str) -> i64 {
        self.section("users")
            .and_then(|users| users.get(user_id))
            .and_then(parse_power_level)
            .or_else(|| self.named("users_default"))
            .unwrap_or(0)
    }

    /// Level required to send an event of `event_type`.
    pub fn send_level(&self, event_type: &str, is_state: bool) -> i64 {
        if let Some(level) = self
            .section("events")
            .and_then(|events| events.get(event_type))
            .and_then(parse_power_level)
        {
            return level;
        }
        if is_state {
            self.named("state_default").unwrap_or(50)
        } else {
            self.named("events_default").unwrap_or(0)
        }
    }
}

/// A typed view of content, one variant per event type the rules inspect.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Create(CreateContent),
    Member(MemberContent),
    JoinRules(JoinRulesContent),
    ThirdPartyInvite(ThirdPartyInviteContent),
    Aliases(AliasesContent),
    Redaction(RedactionContent),
    PowerLevels(JsonObject),
    Other(JsonObject),
}

impl EventContent {
    /// Parse content for the given event type. Never fails: missing or
    /// ill-typed fields become `None`/defaults for the rules to judge.
    pub fn parse(event_type: &str, content: &JsonObject) -> Self {
        match event_type {
            event_type::CREATE => EventContent::Create(CreateContent {
                creator: content
                    .get("creator")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                room_version: content.get("room_version").cloned(),
                federate: content.get(FEDERATE).map_or(true, |v| v == &Value::Bool(true)),
            }),
            event_type::MEMBER => EventContent::Member(MemberContent {
                membership: Membership::from_content(content),
                third_party_invite: content.get("third_party_invite").cloned(),
                authorising_user: content.get(AUTHORISING_USER).cloned(),
            }),
            event_type::JOIN_RULES => EventContent::JoinRules(JoinRulesContent {
                join_rule: content
                    .get("join_rule")
                    .and_then(Value::as_str)
                    .map_or(JoinRule::Invite, JoinRule::parse),
            }),
            event_type::THIRD_PARTY_INVITE => {
                let mut public_keys = Vec::new();
                if let Some(key) = content.get("public_key").and_then(Value::as_str) {
                    public_keys.push(key.to_string());
                }
                if let Some(list) = content.get("public_keys").and_then(Value::as_array) {
                    public_keys.extend(
                        list.iter()
                            .filter_map(|o| o.get("public_key"))
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    );
                }
                EventContent::ThirdPartyInvite(ThirdPartyInviteContent { public_keys })
            }
            event_type::ALIASES => EventContent::Aliases(AliasesContent {
                aliases: content
                    .get("aliases")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            event_type::REDACTION => EventContent::Redaction(RedactionContent {
                reason: content
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            event_type::POWER_LEVELS => EventContent::PowerLevels(content.clone()),
            _ => EventContent::Other(content.clone()),
        }
    }
}
