//! Anonymous sealed boxes using ML-KEM-1024 and AES-256-GCM.
//!
//! A sealed box is readable only by the holder of the recipient's secret key
//! and reveals nothing about the sender. Layout:
//!
//! ```text
//! kem_ciphertext (1568) || nonce (12) || aes_gcm_ciphertext
//! ```
//!
//! The AES key is derived from the KEM shared secret with HKDF-SHA3-256 and
//! zeroized as soon as the cipher has been used.

use crate::crypto::symmetric::NONCE_SIZE;
use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{Ciphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey, SharedSecret};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::Sha3_256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEALED_BOX_INFO: &[u8] = b"dagchat/sealed-box/v1";

/// Public half of an ephemeral box key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct BoxPublicKey {
    key_bytes: Vec<u8>,
}

impl fmt::Debug for BoxPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxPublicKey")
            .field("key_size", &self.key_bytes.len())
            .finish()
    }
}

impl TryFrom<Vec<u8>> for BoxPublicKey {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != mlkem1024::public_key_bytes() {
            return Err(Error::key(format!(
                "ML-KEM-1024 public key must be {} bytes, got {}",
                mlkem1024::public_key_bytes(),
                bytes.len()
            )));
        }
        Ok(Self { key_bytes: bytes })
    }
}

impl From<BoxPublicKey> for Vec<u8> {
    fn from(key: BoxPublicKey) -> Self {
        key.key_bytes
    }
}

impl BoxPublicKey {
    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }
}

/// Ephemeral ML-KEM-1024 key pair used to receive one sealed box.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BoxKeyPair {
    #[zeroize(skip)]
    public: BoxPublicKey,
    secret_bytes: Vec<u8>,
}

impl fmt::Debug for BoxKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxKeyPair")
            .field("public", &self.public)
            .finish()
    }
}

impl BoxKeyPair {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        let (public_key, secret_key) = mlkem1024::keypair();
        Self {
            public: BoxPublicKey {
                key_bytes: KemPublicKey::as_bytes(&public_key).to_vec(),
            },
            secret_bytes: KemSecretKey::as_bytes(&secret_key).to_vec(),
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &BoxPublicKey {
        &self.public
    }
}

fn derive_box_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha3_256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SEALED_BOX_INFO, &mut key)
        .map_err(|_| Error::crypto("Failed to derive sealed box key"))?;
    Ok(key)
}

/// Seals `plaintext` to `recipient`.
pub fn seal(recipient: &BoxPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let public_key = mlkem1024::PublicKey::from_bytes(&recipient.key_bytes)
        .map_err(|_| Error::key("Failed to reconstruct ML-KEM-1024 public key"))?;

    let (shared_secret, kem_ciphertext) = mlkem1024::encapsulate(&public_key);
    let mut aes_key = derive_box_key(shared_secret.as_bytes())?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| Error::crypto("Failed to create AES-GCM cipher"));
    aes_key.zeroize();
    let encrypted = cipher?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::crypto("Failed to encrypt sealed box"))?;

    let kem_bytes = kem_ciphertext.as_bytes();
    let mut sealed = Vec::with_capacity(kem_bytes.len() + NONCE_SIZE + encrypted.len());
    sealed.extend_from_slice(kem_bytes);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&encrypted);
    Ok(sealed)
}

/// Opens a sealed box addressed to `keypair`.
pub fn open_sealed(keypair: &BoxKeyPair, sealed: &[u8]) -> Result<Vec<u8>> {
    let kem_len = mlkem1024::ciphertext_bytes();
    if sealed.len() < kem_len + NONCE_SIZE {
        return Err(Error::crypto("Sealed box is truncated"));
    }
    let (kem_bytes, rest) = sealed.split_at(kem_len);
    let (nonce, encrypted) = rest.split_at(NONCE_SIZE);

    let secret_key = mlkem1024::SecretKey::from_bytes(&keypair.secret_bytes)
        .map_err(|_| Error::key("Failed to reconstruct ML-KEM-1024 secret key"))?;
    let kem_ciphertext = mlkem1024::Ciphertext::from_bytes(kem_bytes)
        .map_err(|_| Error::crypto("Failed to reconstruct ML-KEM-1024 ciphertext"))?;

    let shared_secret = mlkem1024::decapsulate(&kem_ciphertext, &secret_key);
    let mut aes_key = derive_box_key(shared_secret.as_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| Error::crypto("Failed to create AES-GCM cipher"));
    aes_key.zeroize();
    cipher?
        .decrypt(Nonce::from_slice(nonce), encrypted)
        .map_err(|_| Error::crypto("Failed to open sealed box or authentication failed"))
}
