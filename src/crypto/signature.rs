//! ML-DSA-87 detached signatures over structured data.
//!
//! Data is bincode-serialized, hashed with SHA3-256 and the digest is signed.
//! Serialization is deterministic, so verifiers rebuild the exact signed bytes
//! from the decoded structure.

use crate::crypto::hash_data;
use crate::crypto::keys::{PrivateKey, PublicKey};
use crate::error::{Error, Result};
use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::DetachedSignature;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A detached ML-DSA-87 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Signature {
    signature_bytes: Vec<u8>,
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("signature_size", &self.signature_bytes.len())
            .finish()
    }
}

impl TryFrom<Vec<u8>> for Signature {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > mldsa87::signature_bytes() {
            return Err(Error::signature(format!(
                "Signature too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            signature_bytes: bytes,
        })
    }
}

impl From<Signature> for Vec<u8> {
    fn from(signature: Signature) -> Self {
        signature.signature_bytes
    }
}

impl Signature {
    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.signature_bytes
    }
}

/// Signs raw bytes.
pub fn sign_message(private_key: &PrivateKey, message: &[u8]) -> Result<Signature> {
    let secret_key = private_key
        .as_mldsa87()
        .map_err(|e| Error::signature(format!("Failed to get ML-DSA-87 secret key: {}", e)))?;

    let message_hash = hash_data(message);
    let signature = mldsa87::detached_sign(&message_hash, &secret_key);

    Ok(Signature {
        signature_bytes: signature.as_bytes().to_vec(),
    })
}

/// Verifies a signature over raw bytes.
pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let public_key = public_key
        .as_mldsa87()
        .map_err(|e| Error::signature(format!("Failed to get ML-DSA-87 public key: {}", e)))?;

    let detached = mldsa87::DetachedSignature::from_bytes(&signature.signature_bytes)
        .map_err(|_| Error::signature("Failed to reconstruct ML-DSA-87 signature"))?;

    let message_hash = hash_data(message);
    mldsa87::verify_detached_signature(&detached, &message_hash, &public_key)
        .map_err(|_| Error::signature("Signature verification failed"))
}

/// Creates a signature over structured data (automatically serializes and hashes)
pub fn sign_data<T: Serialize>(private_key: &PrivateKey, data: &T) -> Result<Signature> {
    let serialized = bincode::serialize(data)
        .map_err(|e| Error::serialization(format!("Failed to serialize data: {}", e)))?;
    sign_message(private_key, &serialized)
}

/// Verifies a signature over structured data
pub fn verify_data_signature<T: Serialize>(
    public_key: &PublicKey,
    data: &T,
    signature: &Signature,
) -> Result<()> {
    let serialized = bincode::serialize(data)
        .map_err(|e| Error::serialization(format!("Failed to serialize data: {}", e)))?;
    verify_signature(public_key, &serialized, signature)
}
