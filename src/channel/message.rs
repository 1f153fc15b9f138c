//! Channel messages.
//!
//! A [`Message`] is one DAG node. Its signed [`MessageContent`] carries the
//! parent hashes, height, delegation chain, timestamp and body. Messages only
//! leave the process as an [`EncryptedMessage`], whose hash is the node's
//! identity in the DAG.
//!
//! Encryption uses the channel key and the nonce stored in the message, so
//! re-encrypting a decrypted message reproduces the same bytes and the same
//! hash.

use crate::crypto::{verify_data_signature, ChannelCipher, PublicKey, Signature, NONCE_SIZE};
use crate::dag::{ContentHash, HASH_SIZE};
use crate::error::{Error, Result};
use crate::identity::{Chain, Identity};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Marker body of the channel's single root message.
    Root,
    /// Application payload, a serialized JSON document.
    Json(String),
}

impl MessageBody {
    /// Builds a JSON body from a value.
    pub fn json(value: &serde_json::Value) -> Result<Self> {
        serde_json::to_string(value)
            .map(MessageBody::Json)
            .map_err(|e| Error::serialization(format!("Failed to encode body: {}", e)))
    }

    /// Size counted against the body cap.
    pub fn size(&self) -> usize {
        match self {
            MessageBody::Root => 0,
            MessageBody::Json(json) => json.len(),
        }
    }

    /// Parses a JSON body. `None` for the root marker.
    pub fn to_value(&self) -> Result<Option<serde_json::Value>> {
        match self {
            MessageBody::Root => Ok(None),
            MessageBody::Json(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| Error::validation(format!("Body is not valid JSON: {}", e))),
        }
    }
}

/// The signed portion of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Parent hashes, strictly ascending. Empty only for the root.
    pub parents: Vec<ContentHash>,
    /// 1 + max height of the included parents; 0 for the root.
    pub height: u64,
    /// Delegation from the channel root to the author.
    pub chain: Chain,
    /// Unix seconds.
    pub timestamp: u64,
    /// Payload.
    pub body: MessageBody,
}

/// Bytes covered by a message signature. The channel id keeps a signed
/// message from being replayed into another channel.
#[derive(Serialize)]
struct SignedContent<'a> {
    channel_id: &'a ContentHash,
    content: &'a MessageContent,
}

/// Plaintext carried inside an [`EncryptedMessage`].
#[derive(Serialize, Deserialize)]
struct Plaintext {
    content: MessageContent,
    signature: Signature,
}

/// A decrypted, signed message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    content: MessageContent,
    signature: Signature,
    nonce: [u8; NONCE_SIZE],
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("height", &self.content.height)
            .field("parents", &self.content.parents.len())
            .field("chain_length", &self.content.chain.len())
            .field("timestamp", &self.content.timestamp)
            .field("body_size", &self.content.body.size())
            .finish()
    }
}

impl Message {
    /// Signs `content` for `channel_id` with `author` and picks a fresh nonce.
    pub fn sign(channel_id: &ContentHash, content: MessageContent, author: &Identity) -> Result<Self> {
        let signature = author.sign(&SignedContent {
            channel_id,
            content: &content,
        })?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        Ok(Self {
            content,
            signature,
            nonce,
        })
    }

    /// Verifies the signature against the author key resolved from the chain.
    pub fn verify_signature(&self, channel_id: &ContentHash, author: &PublicKey) -> Result<()> {
        verify_data_signature(
            author,
            &SignedContent {
                channel_id,
                content: &self.content,
            },
            &self.signature,
        )
    }

    /// Encrypts the message for `channel_id`.
    pub fn encrypt(&self, channel_id: &ContentHash, cipher: &ChannelCipher) -> Result<EncryptedMessage> {
        let plaintext = bincode::serialize(&Plaintext {
            content: self.content.clone(),
            signature: self.signature.clone(),
        })
        .map_err(|e| Error::serialization(format!("Failed to serialize message: {}", e)))?;

        let ciphertext = cipher.encrypt(&self.nonce, &plaintext, channel_id.as_bytes())?;
        Ok(EncryptedMessage {
            channel_id: *channel_id,
            nonce: self.nonce,
            ciphertext,
        })
    }

    /// Hash of the encrypted form.
    pub fn hash(&self, channel_id: &ContentHash, cipher: &ChannelCipher) -> Result<ContentHash> {
        self.encrypt(channel_id, cipher)?.hash()
    }

    /// The signed content.
    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    /// Parent hashes.
    pub fn parents(&self) -> &[ContentHash] {
        &self.content.parents
    }

    /// DAG height.
    pub fn height(&self) -> u64 {
        self.content.height
    }

    /// Delegation chain.
    pub fn chain(&self) -> &Chain {
        &self.content.chain
    }

    /// Unix seconds.
    pub fn timestamp(&self) -> u64 {
        self.content.timestamp
    }

    /// Payload.
    pub fn body(&self) -> &MessageBody {
        &self.content.body
    }

    /// True for the channel root.
    pub fn is_root(&self) -> bool {
        self.content.parents.is_empty()
    }

    /// Author display name, or `None` when posted by the root key.
    pub fn author_name(&self) -> Option<&str> {
        self.content.chain.display_name()
    }
}

/// The form in which messages are stored and sent to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Channel the message belongs to.
    pub channel_id: ContentHash,
    /// AES-GCM nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// AES-256-GCM ciphertext of the signed message.
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// Content hash identifying this message in the DAG.
    pub fn hash(&self) -> Result<ContentHash> {
        ContentHash::compute(self)
    }

    /// Decrypts and decodes the message. Signature checks are left to the
    /// caller.
    pub fn decrypt(&self, cipher: &ChannelCipher) -> Result<Message> {
        let plaintext = cipher.decrypt(&self.nonce, &self.ciphertext, self.channel_id.as_bytes())?;
        let decoded: Plaintext = bincode::deserialize(&plaintext)
            .map_err(|e| Error::validation(format!("Malformed message plaintext: {}", e)))?;
        Ok(Message {
            content: decoded.content,
            signature: decoded.signature,
            nonce: self.nonce,
        })
    }

    /// Serialized size, used for response budgeting.
    pub fn encoded_len(&self) -> usize {
        // two u64 length prefixes, the channel id and the nonce
        8 + HASH_SIZE + NONCE_SIZE + 8 + self.ciphertext.len()
    }

    /// Encodes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::serialization(format!("Failed to encode message: {}", e)))
    }

    /// Decodes from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::serialization(format!("Failed to decode message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Identity, ContentHash, ChannelCipher) {
        let owner = Identity::generate("owner").unwrap();
        let channel_id = ContentHash::from_bytes(owner.public_key().fingerprint());
        let cipher = ChannelCipher::derive(owner.public_key()).unwrap();
        (owner, channel_id, cipher)
    }

    fn root_content() -> MessageContent {
        MessageContent {
            parents: vec![],
            height: 0,
            chain: Chain::empty(),
            timestamp: 1_700_000_000,
            body: MessageBody::Root,
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (owner, channel_id, cipher) = setup();
        let message = Message::sign(&channel_id, root_content(), &owner).unwrap();

        let encrypted = message.encrypt(&channel_id, &cipher).unwrap();
        let decrypted = encrypted.decrypt(&cipher).unwrap();
        assert_eq!(decrypted, message);
        decrypted.verify_signature(&channel_id, owner.public_key()).unwrap();
    }

    #[test]
    fn test_hash_stable_across_reencoding() {
        let (owner, channel_id, cipher) = setup();
        let message = Message::sign(&channel_id, root_content(), &owner).unwrap();

        let encrypted = message.encrypt(&channel_id, &cipher).unwrap();
        let reencoded = EncryptedMessage::from_bytes(&encrypted.to_bytes().unwrap()).unwrap();
        assert_eq!(encrypted.hash().unwrap(), reencoded.hash().unwrap());

        let reencrypted = reencoded
            .decrypt(&cipher)
            .unwrap()
            .encrypt(&channel_id, &cipher)
            .unwrap();
        assert_eq!(encrypted.hash().unwrap(), reencrypted.hash().unwrap());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let (owner, channel_id, cipher) = setup();
        let a = Message::sign(&channel_id, root_content(), &owner).unwrap();

        let mut changed = root_content();
        changed.timestamp += 1;
        let b = Message::sign(&channel_id, changed, &owner).unwrap();

        assert_ne!(
            a.hash(&channel_id, &cipher).unwrap(),
            b.hash(&channel_id, &cipher).unwrap()
        );
    }

    #[test]
    fn test_signature_bound_to_channel() {
        let (owner, channel_id, _) = setup();
        let message = Message::sign(&channel_id, root_content(), &owner).unwrap();
        let other = ContentHash::from_bytes([1u8; 32]);
        assert!(message.verify_signature(&other, owner.public_key()).is_err());
    }

    #[test]
    fn test_json_body() {
        let body = MessageBody::json(&serde_json::json!({ "text": "hello" })).unwrap();
        assert_eq!(
            body.to_value().unwrap(),
            Some(serde_json::json!({ "text": "hello" }))
        );
        assert!(MessageBody::Json("{not json".into()).to_value().is_err());
        assert_eq!(MessageBody::Root.to_value().unwrap(), None);
    }
}
