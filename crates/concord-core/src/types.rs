//! Strong type definitions for Concord.
//!
//! All identifiers are newtypes to prevent misuse at compile time. Parsing
//! checks only the sigil and, where the identifier carries one, the presence
//! of a server name after the first `:`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::CoreError;

/// Return the server name component of a `<sigil>localpart:server` identifier.
///
/// Everything after the first `:` is the server name.
pub fn server_name_of(id: &str) -> Option<&str> {
    id.find(':').map(|idx| &id[idx + 1..])
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $sigil:literal, $needs_server:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// The sigil every identifier of this kind starts with.
            pub const SIGIL: char = $sigil;

            /// Parse and validate an identifier.
            pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
                let s = s.into();
                if !s.starts_with(Self::SIGIL) {
                    return Err(CoreError::InvalidIdentifier(format!(
                        "{} must start with '{}': {}",
                        stringify!($name),
                        Self::SIGIL,
                        s
                    )));
                }
                if $needs_server && server_name_of(&s).map_or(true, str::is_empty) {
                    return Err(CoreError::InvalidIdentifier(format!(
                        "{} has no server name: {}",
                        stringify!($name),
                        s
                    )));
                }
                Ok(Self(s))
            }

            /// Get the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The server name component, if the identifier carries one.
            pub fn server_name(&self) -> Option<&str> {
                server_name_of(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = CoreError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

identifier!(
    /// An event identifier.
    ///
    /// Legacy room versions use `$localpart:server`; later versions use `$`
    /// followed by the unpadded base64 reference hash, with no server name.
    EventId,
    '$',
    false
);

identifier!(
    /// A room identifier: `!opaque:server`.
    RoomId,
    '!',
    true
);

identifier!(
    /// A user identifier: `@localpart:server`.
    UserId,
    '@',
    true
);

impl UserId {
    /// The localpart (between the sigil and the first `:`).
    pub fn localpart(&self) -> &str {
        let end = self.0.find(':').unwrap_or(self.0.len());
        &self.0[1..end]
    }
}

/// The `(type, state_key)` pair that addresses a slot in room state.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, self.state_key)
    }
}

impl<T: Into<String>, K: Into<String>> From<(T, K)> for StateKey {
    fn from((event_type, state_key): (T, K)) -> Self {
        Self::new(event_type, state_key)
    }
}

/// A full state map: at most one event per `(type, state_key)`.
pub type StateMap = BTreeMap<StateKey, EventId>;

/// Difference between two state maps.
///
/// Persistence writes deltas rather than full maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Entries added or replaced.
    pub to_insert: StateMap,
    /// Keys removed entirely.
    pub to_delete: BTreeSet<StateKey>,
}

impl StateDelta {
    /// Compute the delta that turns `old` into `new`.
    pub fn between(old: &StateMap, new: &StateMap) -> Self {
        let to_insert = new
            .iter()
            .filter(|(key, id)| old.get(*key) != Some(*id))
            .map(|(key, id)| (key.clone(), id.clone()))
            .collect();
        let to_delete = old
            .keys()
            .filter(|key| !new.contains_key(*key))
            .cloned()
            .collect();
        Self {
            to_insert,
            to_delete,
        }
    }

    /// Apply this delta to a state map in place.
    pub fn apply(&self, state: &mut StateMap) {
        for key in &self.to_delete {
            state.remove(key);
        }
        for (key, id) in &self.to_insert {
            state.insert(key.clone(), id.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_delete.is_empty()
    }
}

/// Well-known event types.
pub mod event_type {
    pub const CREATE: &str = "m.room.create";
    pub const MEMBER: &str = "m.room.member";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const JOIN_RULES: &str = "m.room.join_rules";
    pub const THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";
    pub const ALIASES: &str = "m.room.aliases";
    pub const REDACTION: &str = "m.room.redaction";
    pub const HISTORY_VISIBILITY: &str = "m.room.history_visibility";
    pub const NAME: &str = "m.room.name";
    pub const MESSAGE: &str = "m.room.message";
    pub const HISTORICAL_INSERTION: &str = "org.matrix.msc2716.insertion";
    pub const HISTORICAL_BATCH: &str = "org.matrix.msc2716.batch";
    pub const HISTORICAL_MARKER: &str = "org.matrix.msc2716.marker";
}
