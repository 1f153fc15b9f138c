//! ML-DSA-87 signing keys.
//!
//! Identities and channels are both named by an ML-DSA-87 public key. Public
//! keys are length-checked whenever they are built from untrusted bytes, so a
//! decoded packet can never carry a key of the wrong size.

use crate::crypto::hash_data;
use crate::error::{Error, Result};
use pqcrypto_mldsa::mldsa87::{self, PublicKey as Mldsa87PublicKey, SecretKey as Mldsa87SecretKey};
use pqcrypto_traits::sign::{PublicKey as SignPublicKey, SecretKey as SignSecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An ML-DSA-87 public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PublicKey {
    key_bytes: Vec<u8>,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &hex::encode(&self.fingerprint()[..8]))
            .field("key_size", &self.key_bytes.len())
            .finish()
    }
}

impl TryFrom<Vec<u8>> for PublicKey {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes(bytes)
    }
}

impl From<PublicKey> for Vec<u8> {
    fn from(key: PublicKey) -> Self {
        key.key_bytes
    }
}

impl PublicKey {
    /// Size of an encoded ML-DSA-87 public key.
    pub fn size() -> usize {
        mldsa87::public_key_bytes()
    }

    /// Builds a public key from raw bytes, checking the length.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != Self::size() {
            return Err(Error::key(format!(
                "ML-DSA-87 public key must be {} bytes, got {}",
                Self::size(),
                bytes.len()
            )));
        }
        Ok(Self { key_bytes: bytes })
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    /// SHA3-256 of the key bytes.
    pub fn fingerprint(&self) -> [u8; 32] {
        hash_data(&self.key_bytes)
    }

    pub(crate) fn as_mldsa87(&self) -> Result<Mldsa87PublicKey> {
        Mldsa87PublicKey::from_bytes(&self.key_bytes)
            .map_err(|_| Error::key("Failed to reconstruct ML-DSA-87 public key from bytes"))
    }
}

/// An ML-DSA-87 secret key. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    key_bytes: Vec<u8>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_size", &self.key_bytes.len())
            .finish()
    }
}

impl PrivateKey {
    pub(crate) fn as_mldsa87(&self) -> Result<Mldsa87SecretKey> {
        Mldsa87SecretKey::from_bytes(&self.key_bytes)
            .map_err(|_| Error::key("Failed to reconstruct ML-DSA-87 secret key from bytes"))
    }
}

/// A signing key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

impl KeyPair {
    /// Generates a new ML-DSA-87 key pair.
    ///
    /// `mldsa87::keypair()` draws from the library's internal CSPRNG.
    pub fn generate() -> Self {
        let (public_key, secret_key) = mldsa87::keypair();
        Self {
            public: PublicKey {
                key_bytes: SignPublicKey::as_bytes(&public_key).to_vec(),
            },
            private: PrivateKey {
                key_bytes: SignSecretKey::as_bytes(&secret_key).to_vec(),
            },
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the secret half.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Checks that both halves decode into ML-DSA-87 keys.
    pub fn validate(&self) -> Result<()> {
        self.public.as_mldsa87()?;
        self.private.as_mldsa87()?;
        Ok(())
    }
}
