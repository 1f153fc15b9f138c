//! Cryptographic primitives for dagchat.
//!
//! Everything here wraps audited implementations; nothing is reimplemented:
//!
//! - **ML-DSA-87**: identity and channel signing keys
//! - **ML-KEM-1024**: sealed boxes for invite delivery
//! - **AES-256-GCM**: channel message encryption and sealed box payloads
//! - **SHA3-256 / HMAC-SHA3-256 / HKDF-SHA3-256**: hashing, keyed hashing and
//!   key derivation

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha3::{Digest, Sha3_256};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

pub mod keys;
pub mod sealed;
pub mod signature;
pub mod symmetric;

pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use sealed::{open_sealed, seal, BoxKeyPair, BoxPublicKey};
pub use signature::{sign_data, verify_data_signature, Signature};
pub use symmetric::{ChannelCipher, NONCE_SIZE};

type HmacSha3_256 = Hmac<Sha3_256>;

/// Cryptographic hash function using SHA3-256
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Keyed hash (HMAC-SHA3-256) of `data` under `key`.
pub fn keyed_hash(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha3_256::new_from_slice(key)
        .map_err(|e| Error::crypto(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time equality for key material and identifiers.
pub fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Returns the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_data_deterministic() {
        assert_eq!(hash_data(b"dagchat"), hash_data(b"dagchat"));
        assert_ne!(hash_data(b"dagchat"), hash_data(b"dagchat!"));
    }

    #[test]
    fn test_keyed_hash_depends_on_key() {
        let a = keyed_hash(b"key-a", b"payload").unwrap();
        let b = keyed_hash(b"key-b", b"payload").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, keyed_hash(b"key-a", b"payload").unwrap());
    }

    #[test]
    fn test_bytes_equal() {
        assert!(bytes_equal(b"abc", b"abc"));
        assert!(!bytes_equal(b"abc", b"abd"));
        assert!(!bytes_equal(b"abc", b"ab"));
    }
}
