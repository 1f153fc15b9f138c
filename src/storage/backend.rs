//! The persistence contract consumed by the storage cache.
//!
//! Backends store encrypted messages with just enough plaintext metadata
//! (hash, parents, height) to answer DAG queries without decrypting, plus an
//! opaque key/value space for identities and channel metadata.

use crate::dag::{ContentHash, DagNodeOps};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resume point for a paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// First message at or above this height.
    Height(u64),
    /// Position of this message.
    Hash(ContentHash),
}

/// A sync page entry: hash and parents, no body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbbreviatedMessage {
    pub hash: ContentHash,
    pub parents: Vec<ContentHash>,
}

impl DagNodeOps for AbbreviatedMessage {
    fn hash(&self) -> &ContentHash {
        &self.hash
    }

    fn parent_hashes(&self) -> &[ContentHash] {
        &self.parents
    }
}

/// A message as persisted by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub channel_id: ContentHash,
    pub hash: ContentHash,
    pub parents: Vec<ContentHash>,
    pub height: u64,
    /// Encoded `EncryptedMessage`.
    pub data: Vec<u8>,
}

impl StoredMessage {
    /// Abbreviated form for query pages.
    pub fn abbreviate(&self) -> AbbreviatedMessage {
        AbbreviatedMessage {
            hash: self.hash,
            parents: self.parents.clone(),
        }
    }
}

/// One page of a query, ordered by (height, hash).
///
/// `forward_hash` is the first entry after the page and `backward_hash` is the
/// first entry of the page when more entries precede it. Querying forward from
/// `forward_hash` continues the walk, querying backward from `backward_hash`
/// returns what came before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPage {
    pub messages: Vec<AbbreviatedMessage>,
    pub forward_hash: Option<ContentHash>,
    pub backward_hash: Option<ContentHash>,
}

/// Pluggable persistence for channels and entities.
///
/// Implementations must make `add_message` idempotent and keep the leaf set
/// exact: a message is a leaf until some stored message names it as a parent.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stores a message. Returns `false` if it was already present.
    async fn add_message(&self, message: StoredMessage) -> Result<bool>;

    /// Checks whether a message is stored.
    async fn has_message(&self, channel_id: &ContentHash, hash: &ContentHash) -> Result<bool>;

    /// Loads a message.
    async fn get_message(
        &self,
        channel_id: &ContentHash,
        hash: &ContentHash,
    ) -> Result<Option<StoredMessage>>;

    /// Loads several messages, preserving the order of `hashes`.
    async fn get_messages(
        &self,
        channel_id: &ContentHash,
        hashes: &[ContentHash],
    ) -> Result<Vec<Option<StoredMessage>>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(self.get_message(channel_id, hash).await?);
        }
        Ok(out)
    }

    /// Hashes of messages no other stored message references, sorted.
    async fn get_leaf_hashes(&self, channel_id: &ContentHash) -> Result<Vec<ContentHash>>;

    /// Number of stored messages in the channel.
    async fn get_message_count(&self, channel_id: &ContentHash) -> Result<u64>;

    /// Windowed range query in (height, hash) order.
    async fn query(
        &self,
        channel_id: &ContentHash,
        cursor: &Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QueryPage>;

    /// Deletes every message of the channel.
    async fn remove_channel_messages(&self, channel_id: &ContentHash) -> Result<()>;

    /// Stores an opaque entity.
    async fn store_entity(&self, kind: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Loads an opaque entity.
    async fn retrieve_entity(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deletes an opaque entity.
    async fn remove_entity(&self, kind: &str, key: &str) -> Result<()>;

    /// Lists entity keys of a kind.
    async fn get_entity_keys(&self, kind: &str) -> Result<Vec<String>>;
}
