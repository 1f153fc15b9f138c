//! Content-addressed hashing for DAG nodes.
//!
//! This module provides the `ContentHash` type, a 32-byte SHA3-256 hash used
//! as the content address of messages and as channel ids. The hash is
//! computed over bincode-serialized data, ensuring deterministic addressing.

use crate::crypto::hash_data;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of a content hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte content hash using SHA3-256.
///
/// Ordering is bytewise, which is the tiebreak used wherever messages of equal
/// height must be put in a deterministic order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_SIZE]);

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ContentHashVisitor;

        impl<'de> serde::de::Visitor<'de> for ContentHashVisitor {
            type Value = ContentHash;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte array of length 32")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != HASH_SIZE {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut arr = [0u8; HASH_SIZE];
                arr.copy_from_slice(v);
                Ok(ContentHash(arr))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut arr = [0u8; HASH_SIZE];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(ContentHash(arr))
            }
        }

        deserializer.deserialize_bytes(ContentHashVisitor)
    }
}

impl ContentHash {
    /// The smallest possible hash, used as a lower bound in ordered ranges.
    pub const MIN: ContentHash = ContentHash([0u8; HASH_SIZE]);

    /// Computes the content hash of serializable data.
    ///
    /// Uses bincode for deterministic serialization, then SHA3-256 for hashing.
    pub fn compute<T: Serialize>(data: &T) -> Result<Self> {
        let serialized = bincode::serialize(data)
            .map_err(|e| Error::serialization(format!("Failed to serialize for hash: {}", e)))?;
        Ok(Self(hash_data(&serialized)))
    }

    /// Creates a ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a ContentHash from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::validation("ContentHash must be exactly 32 bytes"))?;
        Ok(Self(arr))
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Returns hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a ContentHash from a hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| Error::validation("Invalid hex string for ContentHash"))?;
        if bytes.len() != HASH_SIZE {
            return Err(Error::validation(
                "ContentHash must be exactly 32 bytes (64 hex characters)",
            ));
        }
        Self::from_slice(&bytes)
    }

    /// Returns a short form of the hash for display (first 8 bytes / 16 hex chars).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}
