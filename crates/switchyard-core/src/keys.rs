//! WireGuard client keys
//!
//! The client private key is generated locally and never leaves the
//! device; only the derived public key is registered with the API.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;

    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength)
}

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            secret: StaticSecret::from(decode_key(s)?),
        })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            key: X25519Public::from(decode_key(s)?),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// The device's WireGuard identity
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Reuse a stored private key, or generate a fresh pair when the
    /// stored value is missing or unreadable.
    ///
    /// The boolean is `true` when a new key was generated and must be saved.
    pub fn load_or_generate(stored: Option<&str>) -> (Self, bool) {
        match stored.map(PrivateKey::from_base64) {
            Some(Ok(private)) => (Self::from_private(private), false),
            _ => (Self::generate(), true),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_roundtrip() {
        let keypair = KeyPair::generate();

        let b64 = keypair.private.to_base64();
        let restored = PrivateKey::from_base64(&b64).unwrap();

        assert_eq!(restored.public_key(), keypair.public);
    }

    #[test]
    fn test_load_or_generate_reuses_stored_key() {
        let original = KeyPair::generate();
        let stored = original.private.to_base64();

        let (loaded, generated) = KeyPair::load_or_generate(Some(&stored));
        assert!(!generated);
        assert_eq!(loaded.public, original.public);
    }

    #[test]
    fn test_load_or_generate_replaces_garbage() {
        let (_, generated) = KeyPair::load_or_generate(Some("not a key"));
        assert!(generated);

        let (_, generated) = KeyPair::load_or_generate(None);
        assert!(generated);
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(
            PublicKey::from_base64("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        );
        assert_eq!(PublicKey::from_base64("AAAA"), Err(KeyError::InvalidLength));
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{:?}", key), "PrivateKey([redacted])");
    }
}
