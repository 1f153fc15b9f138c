//! Channel symmetric encryption.
//!
//! Every member of a channel can read it, so the channel key is derived
//! deterministically from the channel's public key with HKDF-SHA3-256.
//! Encryption takes an explicit nonce and is a pure function of its inputs:
//! the same plaintext, key and nonce always produce the same ciphertext, which
//! keeps message hashes stable without caching encrypted counterparts.

use crate::crypto::keys::PublicKey;
use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use sha3::Sha3_256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

const CHANNEL_KEY_SALT: &[u8] = b"dagchat/channel-key/v1";
const CHANNEL_KEY_INFO: &[u8] = b"aes-256-gcm";

/// AES-256-GCM cipher keyed for one channel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelCipher {
    key: [u8; 32],
}

impl fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelCipher(..)")
    }
}

impl ChannelCipher {
    /// Derives the channel key from the channel's public key.
    pub fn derive(channel_public_key: &PublicKey) -> Result<Self> {
        let hkdf = Hkdf::<Sha3_256>::new(Some(CHANNEL_KEY_SALT), channel_public_key.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(CHANNEL_KEY_INFO, &mut key)
            .map_err(|_| Error::crypto("Failed to derive channel key"))?;
        Ok(Self { key })
    }

    /// Encrypts `plaintext`, binding `aad` into the authentication tag.
    pub fn encrypt(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::crypto("Failed to create AES-GCM cipher"))?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::crypto("Failed to encrypt with AES-GCM"))
    }

    /// Decrypts and authenticates `ciphertext`.
    pub fn decrypt(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::crypto("Failed to create AES-GCM cipher"))?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::crypto("Failed to decrypt or authentication failed"))
    }
}
