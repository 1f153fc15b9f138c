//! Invite exchange.
//!
//! A would-be member publishes an [`InviteRequest`] out of band (its peer id,
//! signing key and an ephemeral ML-KEM-1024 box key) and keeps the matching
//! [`InviteSecret`]. A member of the channel issues a link to the requester,
//! appends it to its own chain and sends the resulting [`InvitePayload`]
//! sealed to the box key. Only the holder of the secret can open it.

use crate::channel::validate_channel_name;
use crate::crypto::{keyed_hash, open_sealed, seal, BoxKeyPair, BoxPublicKey, PublicKey};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::identity::{Chain, Identity};
use crate::protocol::packet::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HMAC key for deriving request ids from box keys.
const REQUEST_ID_KEY: &[u8] = b"dagchat/invite-request";

/// Identifier a sealed invite is addressed to.
pub fn request_id(box_public_key: &BoxPublicKey) -> Result<[u8; 32]> {
    keyed_hash(REQUEST_ID_KEY, box_public_key.as_bytes())
}

/// Public half of an invite exchange, shared with an inviting member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRequest {
    /// Peer the sealed invite must be delivered to.
    pub peer_id: PeerId,
    /// Key the issued link delegates to.
    pub trustee_public_key: PublicKey,
    /// Ephemeral key the payload is sealed to.
    pub box_public_key: BoxPublicKey,
}

impl InviteRequest {
    /// Request id the invite will carry.
    pub fn request_id(&self) -> Result<[u8; 32]> {
        request_id(&self.box_public_key)
    }

    /// Hex encoding for out-of-band transfer.
    pub fn to_hex(&self) -> Result<String> {
        bincode::serialize(self)
            .map(hex::encode)
            .map_err(|e| Error::serialization(format!("Failed to encode invite request: {}", e)))
    }

    /// Parses [`InviteRequest::to_hex`] output.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::serialization(format!("Invalid invite request hex: {}", e)))?;
        bincode::deserialize(&bytes)
            .map_err(|e| Error::serialization(format!("Failed to decode invite request: {}", e)))
    }
}

/// Private half of an invite exchange. Zeroizes the box secret on drop.
pub struct InviteSecret {
    request_id: [u8; 32],
    box_keypair: BoxKeyPair,
}

impl fmt::Debug for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteSecret")
            .field("request_id", &hex::encode(&self.request_id[..8]))
            .finish()
    }
}

impl InviteSecret {
    /// Request id this secret answers.
    pub fn request_id(&self) -> &[u8; 32] {
        &self.request_id
    }

    /// Opens a sealed invite and checks it is well formed.
    pub fn open(&self, sealed_box: &[u8]) -> Result<InvitePayload> {
        let plaintext = open_sealed(&self.box_keypair, sealed_box)?;
        let payload: InvitePayload = bincode::deserialize(&plaintext)
            .map_err(|e| Error::validation(format!("Malformed invite payload: {}", e)))?;
        validate_channel_name(&payload.channel_name)?;
        if payload.chain.is_empty() {
            return Err(Error::validation("Invite carries an empty chain"));
        }
        Ok(payload)
    }
}

/// Creates a request for `identity`, reachable at `peer_id`.
pub fn create_request(peer_id: PeerId, identity: &Identity) -> Result<(InviteRequest, InviteSecret)> {
    let box_keypair = BoxKeyPair::generate();
    let request = InviteRequest {
        peer_id,
        trustee_public_key: identity.public_key().clone(),
        box_public_key: box_keypair.public_key().clone(),
    };
    let secret = InviteSecret {
        request_id: request.request_id()?,
        box_keypair,
    };
    Ok((request, secret))
}

/// What an invited identity needs to join a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub channel_name: String,
    pub channel_public_key: PublicKey,
    /// Chain from the channel root to the invited identity.
    pub chain: Chain,
}

impl InvitePayload {
    /// Builds a payload delegating to `request`'s trustee through `member`.
    pub fn issue(
        member: &Identity,
        channel_name: &str,
        channel_public_key: &PublicKey,
        request: &InviteRequest,
        display_name: &str,
    ) -> Result<Self> {
        let channel_id = ContentHash::from_bytes(channel_public_key.fingerprint());
        let held = member.chain_for(&channel_id, channel_public_key)?;
        let link = member.issue_link(
            &channel_id,
            channel_public_key,
            &request.trustee_public_key,
            display_name,
            None,
            None,
        )?;
        Ok(Self {
            channel_name: channel_name.to_string(),
            channel_public_key: channel_public_key.clone(),
            chain: held.extend(link)?,
        })
    }

    /// Channel id of the invited channel.
    pub fn channel_id(&self) -> ContentHash {
        ContentHash::from_bytes(self.channel_public_key.fingerprint())
    }

    /// Seals the payload to `recipient`.
    pub fn seal(&self, recipient: &BoxPublicKey) -> Result<Vec<u8>> {
        let plaintext = bincode::serialize(self)
            .map_err(|e| Error::serialization(format!("Failed to encode invite payload: {}", e)))?;
        seal(recipient, &plaintext)
    }
}
