//! Error types for Concord core.
//!
//! [`SizeError`] and [`SignatureError`] are permanent for the event instance
//! that produced them. [`AuthError`] is relative to the auth events it was
//! checked against; the same event may pass against a different set.

use thiserror::Error;

/// Core errors: identifiers, encoding and decoding.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("unknown room version: {0}")]
    UnknownRoomVersion(String),

    #[error("invalid canonical json: {0}")]
    InvalidCanonicalJson(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("event id mismatch: expected {expected}, got {actual}")]
    EventIdMismatch { expected: String, actual: String },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DecodingError(e.to_string())
    }
}

/// An event field or the whole event exceeds a size limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeError {
    #[error("'{field}' too large: {len} > {max} bytes")]
    FieldTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("event too large: {len} > {max} bytes")]
    EventTooLarge { len: usize, max: usize },

    #[error("event could not be encoded: {0}")]
    Unencodable(String),
}

/// A required signature is missing or does not verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Event not signed by sender's server {0}")]
    NotSignedBySender(String),

    #[error("Event not signed by sending server {0}")]
    NotSignedByOrigin(String),

    #[error("Event not signed by authorising server {0}")]
    NotSignedByAuthoriser(String),

    #[error("no usable key {key_id} for server {server}")]
    UnknownKey { server: String, key_id: String },

    #[error("signature from {server} with key {key_id} does not verify")]
    Invalid { server: String, key_id: String },

    #[error("malformed identifier in signature check: {0}")]
    MalformedId(String),
}

impl SignatureError {
    /// The server whose signature was expected, where known.
    pub fn expected_domain(&self) -> Option<&str> {
        match self {
            SignatureError::NotSignedBySender(d)
            | SignatureError::NotSignedByOrigin(d)
            | SignatureError::NotSignedByAuthoriser(d) => Some(d),
            SignatureError::UnknownKey { server, .. } | SignatureError::Invalid { server, .. } => {
                Some(server)
            }
            SignatureError::MalformedId(_) => None,
        }
    }
}

/// Category of an auth failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Policy rejection (HTTP 403).
    Forbidden,
    /// Malformed content the rules cannot interpret (HTTP 400).
    InvalidContent,
    /// The caller broke a precondition of the engine (HTTP 500).
    Invariant,
}

/// An event fails the authorization rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {reason}")]
pub struct AuthError {
    pub code: u16,
    pub kind: AuthErrorKind,
    pub reason: String,
}

impl AuthError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            code: 403,
            kind: AuthErrorKind::Forbidden,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            code: 400,
            kind: AuthErrorKind::InvalidContent,
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self {
            code: 500,
            kind: AuthErrorKind::Invariant,
            reason: reason.into(),
        }
    }

    /// True when the error reports misuse of the engine rather than a bad event.
    pub fn is_invariant_violation(&self) -> bool {
        self.kind == AuthErrorKind::Invariant
    }
}

impl From<SignatureError> for AuthError {
    fn from(e: SignatureError) -> Self {
        AuthError::forbidden(e.to_string())
    }
}

/// Everything that can make an event invalid for its room version before any
/// state is consulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Size(#[from] SizeError),

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_codes() {
        assert_eq!(AuthError::forbidden("x").code, 403);
        assert_eq!(AuthError::invalid("x").code, 400);
        let e = AuthError::invariant("x");
        assert_eq!(e.code, 500);
        assert!(e.is_invariant_violation());
    }

    #[test]
    fn test_signature_error_names_domain() {
        let e = SignatureError::NotSignedBySender("example.org".into());
        assert_eq!(e.expected_domain(), Some("example.org"));
        assert!(e.to_string().contains("example.org"));
        let auth: AuthError = e.into();
        assert_eq!(auth.code, 403);
    }
}
