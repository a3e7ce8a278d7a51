//! Cryptographic primitives for Concord.
//!
//! Wraps Ed25519 signing and Blake3 hashing with strong types, and defines
//! the [`SignatureVerifier`] capability the validation layer calls into.

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Encode bytes as unpadded standard base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// Encode bytes as unpadded URL-safe base64.
pub fn encode_base64_url(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64 in either alphabet, with or without padding.
pub fn decode_base64(s: &str) -> Result<Vec<u8>, CoreError> {
    let trimmed = s.trim_end_matches('=');
    general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| CoreError::DecodingError(format!("base64: {}", e)))
}

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Unpadded base64 form.
    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_base64()[..16])
    }
}

impl AsRef<[u8]> for Blake3Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    /// Parse from base64.
    pub fn from_base64(s: &str) -> Result<Self, CoreError> {
        let bytes = decode_base64(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_base64()[..16])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    pub fn from_base64(s: &str) -> Result<Self, CoreError> {
        let bytes = decode_base64(s)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidSignature)?;
        Ok(Self(arr))
    }

    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_base64()[..16])
    }
}

/// A keypair for signing events.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// A server's signing identity: its name, the key ID, and the key.
#[derive(Clone, Debug)]
pub struct ServerKeypair {
    pub server_name: String,
    pub key_id: String,
    pub keypair: Keypair,
}

impl ServerKeypair {
    pub fn new(server_name: impl Into<String>, key_id: impl Into<String>, keypair: Keypair) -> Self {
        Self {
            server_name: server_name.into(),
            key_id: key_id.into(),
            keypair,
        }
    }

    /// Deterministic identity for a server, derived from its name.
    pub fn derive(server_name: &str) -> Self {
        let seed = *blake3::hash(server_name.as_bytes()).as_bytes();
        Self::new(server_name, "ed25519:auto", Keypair::from_seed(&seed))
    }
}

/// The external signature verification capability.
///
/// Answers whether `signature` by `server_name`'s key `key_id` is valid over
/// `signed_bytes`. Key fetching and validity periods are the implementor's
/// concern.
pub trait SignatureVerifier: Send + Sync {
    fn verify_signature(
        &self,
        server_name: &str,
        key_id: &str,
        signed_bytes: &[u8],
        signature: &str,
    ) -> bool;

    /// Whether any key for this server is known at all.
    fn knows_server(&self, server_name: &str) -> bool;
}

/// An in-memory set of trusted server keys.
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    keys: HashMap<(String, String), Ed25519PublicKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&mut self, server_name: &str, key_id: &str, key: Ed25519PublicKey) {
        self.keys
            .insert((server_name.to_string(), key_id.to_string()), key);
    }

    pub fn add_server(&mut self, server: &ServerKeypair) {
        self.add_key(&server.server_name, &server.key_id, server.keypair.public_key());
    }
}

impl SignatureVerifier for KeyRing {
    fn verify_signature(
        &self,
        server_name: &str,
        key_id: &str,
        signed_bytes: &[u8],
        signature: &str,
    ) -> bool {
        let Some(key) = self.keys.get(&(server_name.to_string(), key_id.to_string())) else {
            return false;
        };
        match Ed25519Signature::from_base64(signature) {
            Ok(sig) => key.verify(signed_bytes, &sig).is_ok(),
            Err(_) => false,
        }
    }

    fn knows_server(&self, server_name: &str) -> bool {
        self.keys.keys().any(|(server, _)| server == server_name)
    }
}
