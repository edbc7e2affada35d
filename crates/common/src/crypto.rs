//! WireGuard key issuance
//!
//! Keys are X25519 static secrets; the public key is the base-point product of the
//! clamped private scalar, so any client holding the private key can recompute it.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key pair, base64 encoded as `wg genkey` / `wg pubkey` print them
#[derive(Clone, PartialEq, Eq)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a new key pair from the OS entropy source.
///
/// Fails only when the entropy source does; callers must abort the registration.
pub fn generate_key_pair() -> Result<WgKeyPair> {
    let mut private_key_bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut private_key_bytes)
        .map_err(|e| Error::KeyGenerationFailed(e.to_string()))?;

    clamp(&mut private_key_bytes);

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    Ok(WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Derive the base64 public key for a base64 private key.
pub fn public_key_from_private(private_key: &str) -> Result<String> {
    let bytes = decode_key(private_key)?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Check that a string is a well-formed base64 WireGuard key.
pub fn validate_key(key: &str) -> Result<()> {
    decode_key(key).map(|_| ())
}

fn decode_key(key: &str) -> Result<[u8; 32]> {
    let raw = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::InvalidInput(format!("Invalid base64 key: {}", e)))?;
    raw.try_into()
        .map_err(|_| Error::InvalidInput("Key must be 32 bytes".to_string()))
}

// WireGuard key clamping
fn clamp(bytes: &mut [u8; 32]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = generate_key_pair().unwrap();
        assert_eq!(kp.private_key.len(), 44); // Base64 of 32 bytes
        assert_eq!(kp.public_key.len(), 44);
        assert_ne!(kp.private_key, kp.public_key);
    }

    #[test]
    fn test_public_key_is_derived_from_private() {
        let kp = generate_key_pair().unwrap();
        assert_eq!(public_key_from_private(&kp.private_key).unwrap(), kp.public_key);
    }

    #[test]
    fn test_public_key_is_not_byte_reversal() {
        let kp = generate_key_pair().unwrap();
        let mut reversed = STANDARD.decode(&kp.private_key).unwrap();
        reversed.reverse();
        assert_ne!(STANDARD.encode(reversed), kp.public_key);
    }

    #[test]
    fn test_private_key_is_clamped() {
        let kp = generate_key_pair().unwrap();
        let bytes = STANDARD.decode(&kp.private_key).unwrap();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }

    #[test]
    fn test_distinct_pairs() {
        let a = generate_key_pair().unwrap();
        let b = generate_key_pair().unwrap();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn test_debug_hides_private_key() {
        let kp = generate_key_pair().unwrap();
        let rendered = format!("{:?}", kp);
        assert!(!rendered.contains(&kp.private_key));
        assert!(rendered.contains(&kp.public_key));
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(validate_key("not-base64!").is_err());
        assert!(validate_key(&STANDARD.encode([1u8; 16])).is_err());
        assert!(public_key_from_private(&STANDARD.encode([7u8; 32])).is_ok());
    }
}
