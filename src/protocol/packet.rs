//! Wire packets.
//!
//! Every frame is one bincode-encoded value: [`Hello`] and [`Shake`] during the
//! handshake, [`Packet`] afterwards. The enums are closed, so a frame with an
//! unknown tag fails to decode and the session treats it as a violation.
//!
//! Decoding never trusts sizes: the codec is bounded by [`MAX_PACKET_SIZE`]
//! and [`Packet::validate`] enforces per-field limits before a packet is
//! dispatched.

use crate::channel::EncryptedMessage;
use crate::constants::{
    MAX_BULK_COUNT, MAX_CIPHERTEXT_SIZE, MAX_ERROR_REASON_SIZE, MAX_PACKET_SIZE, MAX_PARENTS,
    MAX_QUERY_LIMIT, MAX_SEALED_BOX_SIZE,
};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::storage::{AbbreviatedMessage, Cursor};
use bincode::Options;
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Random per-process peer identifier.
///
/// Ordered as a 256-bit big-endian integer; the smaller id leads the
/// handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates an id from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// First frame in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub peer_id: PeerId,
}

/// Leader's verdict on whether the connection duplicates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shake {
    pub is_duplicate: bool,
}

/// Post-handshake packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Fatal error; the sender closes after sending it.
    Error { reason: String },
    /// Sealed [`InvitePayload`](super::invite::InvitePayload) for a pending
    /// request.
    EncryptedInvite {
        request_id: [u8; 32],
        sealed_box: Vec<u8>,
    },
    Query {
        channel_id: ContentHash,
        cursor: Cursor,
        is_backward: bool,
        limit: u32,
    },
    QueryResponse {
        channel_id: ContentHash,
        messages: Vec<AbbreviatedMessage>,
        forward_hash: Option<ContentHash>,
        backward_hash: Option<ContentHash>,
    },
    Bulk {
        channel_id: ContentHash,
        hashes: Vec<ContentHash>,
    },
    BulkResponse {
        channel_id: ContentHash,
        messages: Vec<EncryptedMessage>,
        forward_index: u32,
    },
    /// The sender has new messages in the channel.
    Notification { channel_id: ContentHash },
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PACKET_SIZE as u64)
}

/// Encodes a frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    codec()
        .serialize(value)
        .map_err(|e| Error::serialization(format!("Failed to encode frame: {}", e)))
}

/// Decodes a frame. Any failure is a protocol violation by the sender.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(Error::protocol(format!(
            "Frame of {} bytes exceeds {}",
            bytes.len(),
            MAX_PACKET_SIZE
        )));
    }
    codec()
        .deserialize(bytes)
        .map_err(|e| Error::protocol(format!("Malformed frame: {}", e)))
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_ERROR_REASON_SIZE {
        return reason.to_string();
    }
    let mut end = MAX_ERROR_REASON_SIZE;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

impl Packet {
    /// Builds an error packet, truncating the reason to the wire limit.
    pub fn error(reason: impl fmt::Display) -> Self {
        Packet::Error {
            reason: truncate_reason(&reason.to_string()),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Error { .. } => "error",
            Packet::EncryptedInvite { .. } => "encrypted_invite",
            Packet::Query { .. } => "query",
            Packet::QueryResponse { .. } => "query_response",
            Packet::Bulk { .. } => "bulk",
            Packet::BulkResponse { .. } => "bulk_response",
            Packet::Notification { .. } => "notification",
        }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Decodes and validates a packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let packet: Packet = decode(bytes)?;
        packet.validate()?;
        Ok(packet)
    }

    /// Checks per-field bounds.
    pub fn validate(&self) -> Result<()> {
        match self {
            Packet::Error { reason } => {
                if reason.len() > MAX_ERROR_REASON_SIZE {
                    return Err(Error::protocol("Error reason too long"));
                }
            }
            Packet::EncryptedInvite { sealed_box, .. } => {
                if sealed_box.len() > MAX_SEALED_BOX_SIZE {
                    return Err(Error::protocol(format!(
                        "Sealed box of {} bytes exceeds {}",
                        sealed_box.len(),
                        MAX_SEALED_BOX_SIZE
                    )));
                }
            }
            Packet::Query { limit, .. } => {
                if *limit == 0 || *limit > MAX_QUERY_LIMIT {
                    return Err(Error::protocol(format!("Query limit {} out of range", limit)));
                }
            }
            Packet::QueryResponse { messages, .. } => {
                if messages.len() > MAX_QUERY_LIMIT as usize {
                    return Err(Error::protocol(format!(
                        "Query response carries {} entries",
                        messages.len()
                    )));
                }
                if messages.iter().any(|m| m.parents.len() > MAX_PARENTS) {
                    return Err(Error::protocol("Query response entry has too many parents"));
                }
            }
            Packet::Bulk { hashes, .. } => {
                if hashes.len() > MAX_BULK_COUNT {
                    return Err(Error::protocol(format!(
                        "Bulk request for {} hashes",
                        hashes.len()
                    )));
                }
            }
            Packet::BulkResponse {
                messages,
                forward_index,
                ..
            } => {
                if messages.len() > MAX_BULK_COUNT {
                    return Err(Error::protocol(format!(
                        "Bulk response carries {} messages",
                        messages.len()
                    )));
                }
                if *forward_index as usize > MAX_BULK_COUNT {
                    return Err(Error::protocol(format!(
                        "Bulk forward index {} out of range",
                        forward_index
                    )));
                }
                if messages
                    .iter()
                    .any(|m| m.ciphertext.len() > MAX_CIPHERTEXT_SIZE)
                {
                    return Err(Error::protocol("Bulk response message too large"));
                }
            }
            Packet::Notification { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_order_is_big_endian() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(PeerId::from_bytes(low) < PeerId::from_bytes(high));
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::Query {
            channel_id: ContentHash::from_bytes([3u8; 32]),
            cursor: Cursor::Height(7),
            is_backward: true,
            limit: 10,
        };
        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = Packet::Notification {
            channel_id: ContentHash::from_bytes([1u8; 32]),
        }
        .to_bytes()
        .unwrap();
        // fixint encoding puts the variant index in the first four bytes
        bytes[..4].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(Packet::from_bytes(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Packet::Notification {
            channel_id: ContentHash::from_bytes([1u8; 32]),
        }
        .to_bytes()
        .unwrap();
        bytes.push(0);
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_query_limit_bounds() {
        let query = |limit| Packet::Query {
            channel_id: ContentHash::from_bytes([1u8; 32]),
            cursor: Cursor::Height(0),
            is_backward: false,
            limit,
        };
        assert!(query(0).validate().is_err());
        assert!(query(1).validate().is_ok());
        assert!(query(MAX_QUERY_LIMIT).validate().is_ok());
        assert!(query(MAX_QUERY_LIMIT + 1).validate().is_err());
    }

    #[test]
    fn test_error_reason_truncated() {
        let packet = Packet::error("é".repeat(200));
        match &packet {
            Packet::Error { reason } => assert!(reason.len() <= MAX_ERROR_REASON_SIZE),
            other => panic!("unexpected packet {:?}", other),
        }
        assert!(packet.validate().is_ok());

        let oversized = Packet::Error {
            reason: "x".repeat(MAX_ERROR_REASON_SIZE + 1),
        };
        assert!(oversized.validate().is_err());
    }
}
