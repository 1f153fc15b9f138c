//! Channels: one group's message DAG.
//!
//! A [`Channel`] owns the root public key, the derived symmetric key and a
//! [`StorageCache`] over the shared backend. [`Channel::receive`] is the only
//! way a message enters the DAG; [`Channel::post`] builds a message from the
//! current leaves and admits it through the same path, so local and remote
//! messages are held to the same rules.

pub mod message;
pub mod validation;

pub use message::{EncryptedMessage, Message, MessageBody, MessageContent};
pub use validation::{ParentInfo, ValidationResult};

use crate::constants::{
    MAX_BULK_RESPONSE_BYTES, MAX_CHANNEL_NAME_SIZE, MAX_CIPHERTEXT_SIZE, MAX_PARENTS,
    MAX_PARENT_DELTA_SECS, MAX_QUERY_LIMIT,
};
use crate::crypto::{current_timestamp, ChannelCipher, PublicKey};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::identity::{Chain, Identity};
use crate::storage::{Cursor, QueryPage, StorageBackend, StorageCache};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace};
use self::validation::{
    expected_height, max_body_size, min_timestamp, validate_against_parents, validate_structure,
};

/// Entity kind under which channel metadata is persisted.
pub const CHANNEL_ENTITY: &str = "channel";

const EVENT_CAPACITY: usize = 256;

/// Outcome of [`Channel::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The message was validated and appended.
    New(ContentHash),
    /// The message was already known.
    Duplicate(ContentHash),
}

impl Received {
    /// Hash of the received message.
    pub fn hash(&self) -> ContentHash {
        match self {
            Received::New(hash) | Received::Duplicate(hash) => *hash,
        }
    }

    /// True if the message was appended by this call.
    pub fn is_new(&self) -> bool {
        matches!(self, Received::New(_))
    }
}

/// Persisted description of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    pub public_key: PublicKey,
    pub root: Option<ContentHash>,
}

impl ChannelMetadata {
    /// Channel id derived from the root key.
    pub fn id(&self) -> ContentHash {
        ContentHash::from_bytes(self.public_key.fingerprint())
    }
}

/// Validates a channel name (1-128 bytes).
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_SIZE {
        return Err(Error::validation(format!(
            "Channel name must be 1-{} bytes, got {}",
            MAX_CHANNEL_NAME_SIZE,
            name.len()
        )));
    }
    Ok(())
}

/// One group's DAG of messages.
pub struct Channel {
    name: String,
    public_key: PublicKey,
    id: ContentHash,
    cache: StorageCache,
    root: RwLock<Option<ContentHash>>,
    // Serializes root admission so two different roots cannot both land
    root_admission: Mutex<()>,
    events: broadcast::Sender<ContentHash>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("root", &*self.root.read())
            .finish()
    }
}

impl Channel {
    fn new(
        name: String,
        public_key: PublicKey,
        root: Option<ContentHash>,
        backend: Arc<dyn StorageBackend>,
        cache_capacity: usize,
    ) -> Result<Self> {
        let id = ContentHash::from_bytes(public_key.fingerprint());
        let cipher = ChannelCipher::derive(&public_key)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            name,
            public_key,
            id,
            cache: StorageCache::new(backend, id, cipher, cache_capacity),
            root: RwLock::new(root),
            root_admission: Mutex::new(()),
            events,
        })
    }

    /// Creates a channel rooted at `owner`'s key and posts its root message.
    pub async fn from_identity(
        owner: &Identity,
        name: &str,
        backend: Arc<dyn StorageBackend>,
        cache_capacity: usize,
    ) -> Result<Self> {
        validate_channel_name(name)?;
        let channel = Self::new(
            name.to_string(),
            owner.public_key().clone(),
            None,
            backend,
            cache_capacity,
        )?;

        let content = MessageContent {
            parents: Vec::new(),
            height: 0,
            chain: Chain::empty(),
            timestamp: current_timestamp(),
            body: MessageBody::Root,
        };
        let root = Message::sign(&channel.id, content, owner)?;
        let encrypted = root.encrypt(&channel.id, channel.cache.cipher())?;
        let hash = channel.receive(&encrypted).await?.hash();

        info!(channel = %channel.id, name = %channel.name, root = %hash, "Created channel");
        Ok(channel)
    }

    /// Joins a channel known only by its root key. The root arrives by sync.
    pub async fn from_public_key(
        name: &str,
        public_key: PublicKey,
        backend: Arc<dyn StorageBackend>,
        cache_capacity: usize,
    ) -> Result<Self> {
        validate_channel_name(name)?;
        let channel = Self::new(name.to_string(), public_key, None, backend, cache_capacity)?;
        channel.save().await?;
        info!(channel = %channel.id, name = %channel.name, "Joined channel");
        Ok(channel)
    }

    /// Restores a channel from persisted metadata.
    pub async fn load(
        id: &ContentHash,
        backend: Arc<dyn StorageBackend>,
        cache_capacity: usize,
    ) -> Result<Self> {
        let bytes = backend
            .retrieve_entity(CHANNEL_ENTITY, &id.to_hex())
            .await?
            .ok_or_else(|| Error::ChannelNotFound(id.to_hex()))?;
        let metadata: ChannelMetadata = bincode::deserialize(&bytes)
            .map_err(|e| Error::serialization(format!("Failed to decode channel metadata: {}", e)))?;
        if metadata.id() != *id {
            return Err(Error::storage(format!("Channel metadata under {} has another id", id)));
        }
        debug!(channel = %id, name = %metadata.name, "Loaded channel");
        Self::new(
            metadata.name,
            metadata.public_key,
            metadata.root,
            backend,
            cache_capacity,
        )
    }

    /// Restores every channel persisted in `backend`.
    pub async fn load_all(
        backend: Arc<dyn StorageBackend>,
        cache_capacity: usize,
    ) -> Result<Vec<Self>> {
        let mut channels = Vec::new();
        for key in backend.get_entity_keys(CHANNEL_ENTITY).await? {
            let id = ContentHash::from_hex(&key)?;
            channels.push(Self::load(&id, Arc::clone(&backend), cache_capacity).await?);
        }
        Ok(channels)
    }

    async fn save(&self) -> Result<()> {
        let metadata = ChannelMetadata {
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            root: *self.root.read(),
        };
        let bytes = bincode::serialize(&metadata)
            .map_err(|e| Error::serialization(format!("Failed to encode channel metadata: {}", e)))?;
        self.cache
            .backend()
            .store_entity(CHANNEL_ENTITY, &self.id.to_hex(), &bytes)
            .await
    }

    async fn set_root(&self, hash: ContentHash) -> Result<()> {
        *self.root.write() = Some(hash);
        debug!(channel = %self.id, root = %hash, "Recorded channel root");
        self.save().await
    }

    /// The channel's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root-of-trust key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// SHA3-256 of the root key.
    pub fn id(&self) -> &ContentHash {
        &self.id
    }

    /// Hash of the root message, once known.
    pub fn root_hash(&self) -> Option<ContentHash> {
        *self.root.read()
    }

    /// Encrypts a message for this channel.
    pub fn encrypt(&self, message: &Message) -> Result<EncryptedMessage> {
        message.encrypt(&self.id, self.cache.cipher())
    }

    /// Validates and appends a message.
    ///
    /// Fails with [`Error::ParentNotFound`] when a parent is not yet known,
    /// which callers treat as a request to backfill rather than a violation.
    pub async fn receive(&self, encrypted: &EncryptedMessage) -> Result<Received> {
        if encrypted.channel_id != self.id {
            return Err(Error::validation(format!(
                "Message for channel {} received on {}",
                encrypted.channel_id, self.id
            )));
        }
        if encrypted.ciphertext.len() > MAX_CIPHERTEXT_SIZE {
            return Err(Error::validation(format!(
                "Ciphertext too large: {} bytes",
                encrypted.ciphertext.len()
            )));
        }

        let hash = encrypted.hash()?;
        if self.cache.has_message(&hash).await? {
            if self.root.read().is_none() {
                if let Some(existing) = self.cache.get_message(&hash).await? {
                    if existing.is_root() {
                        self.set_root(hash).await?;
                    }
                }
            }
            trace!(channel = %self.id, hash = %hash, "Duplicate message");
            return Ok(Received::Duplicate(hash));
        }

        let message = encrypted.decrypt(self.cache.cipher())?;
        let content = message.content();

        let author = content
            .chain
            .verify(&self.public_key, &self.id, content.timestamp)?;
        message.verify_signature(&self.id, &author)?;

        if content.parents.len() > MAX_PARENTS {
            return Err(Error::validation(format!(
                "Too many parents: {}",
                content.parents.len()
            )));
        }
        let resolved = self.cache.get_messages(&content.parents).await?;
        let mut parents = Vec::with_capacity(resolved.len());
        for (hash, parent) in content.parents.iter().zip(resolved) {
            let parent = parent.ok_or(Error::ParentNotFound(*hash))?;
            parents.push(ParentInfo {
                height: parent.height(),
                timestamp: parent.timestamp(),
            });
        }

        let mut result = validate_against_parents(content, &parents, current_timestamp());
        result.errors.extend(validate_structure(content).errors);
        result.into_result()?;

        let is_root = message.is_root();
        let _admission = if is_root {
            let guard = self.root_admission.lock().await;
            if let Some(expected) = self.root_hash() {
                if expected != hash {
                    return Err(Error::RootMismatch {
                        expected,
                        actual: hash,
                    });
                }
            }
            Some(guard)
        } else {
            None
        };

        let height = message.height();
        let inserted = self
            .cache
            .add_message(hash, Arc::new(message), encrypted)
            .await?;
        if is_root && self.root_hash().is_none() {
            self.set_root(hash).await?;
        }
        if !inserted {
            return Ok(Received::Duplicate(hash));
        }

        debug!(channel = %self.id, hash = %hash, height, "Appended message");
        // No subscribers is fine
        let _ = self.events.send(hash);
        Ok(Received::New(hash))
    }

    /// Signs `body` with `author`'s chain and appends it on top of the
    /// current leaves.
    pub async fn post(&self, body: &serde_json::Value, author: &Identity) -> Result<ContentHash> {
        let chain = author.chain_for(&self.id, &self.public_key)?;
        let body = MessageBody::json(body)?;
        let cap = max_body_size(chain.len());
        if body.size() > cap {
            return Err(Error::validation(format!(
                "Body of {} bytes exceeds the {} byte cap for a chain of length {}",
                body.size(),
                cap,
                chain.len()
            )));
        }

        let leaves = self.cache.get_leaf_hashes().await?;
        if leaves.is_empty() {
            return Err(Error::validation("Channel root is not known yet"));
        }
        let mut tips: Vec<(ContentHash, Arc<Message>)> = Vec::with_capacity(leaves.len());
        for (hash, message) in leaves.iter().zip(self.cache.get_messages(&leaves).await?) {
            let message = message.ok_or_else(|| Error::storage(format!("Leaf {} is not stored", hash)))?;
            tips.push((*hash, message));
        }
        // Leaves too far behind the newest one would not count toward height
        let newest = tips.iter().map(|(_, m)| m.timestamp()).max().unwrap_or(0);
        tips.retain(|(_, m)| m.timestamp().saturating_add(MAX_PARENT_DELTA_SECS) >= newest);
        tips.sort_by(|a, b| b.1.height().cmp(&a.1.height()).then(a.0.cmp(&b.0)));
        tips.truncate(MAX_PARENTS);
        tips.sort_by(|a, b| a.0.cmp(&b.0));

        let infos: Vec<ParentInfo> = tips
            .iter()
            .map(|(_, m)| ParentInfo {
                height: m.height(),
                timestamp: m.timestamp(),
            })
            .collect();

        let content = MessageContent {
            parents: tips.iter().map(|(h, _)| *h).collect(),
            height: expected_height(&infos),
            chain,
            timestamp: current_timestamp().max(min_timestamp(&infos)),
            body,
        };
        let message = Message::sign(&self.id, content, author)?;
        let encrypted = self.encrypt(&message)?;
        let hash = self.receive(&encrypted).await?.hash();

        info!(channel = %self.id, hash = %hash, author = author.name(), "Posted message");
        Ok(hash)
    }

    /// Checks whether a message is stored.
    pub async fn has_message(&self, hash: &ContentHash) -> Result<bool> {
        self.cache.has_message(hash).await
    }

    /// Loads a decrypted message.
    pub async fn get_message(&self, hash: &ContentHash) -> Result<Option<Arc<Message>>> {
        self.cache.get_message(hash).await
    }

    /// Current leaf hashes, sorted.
    pub async fn leaves(&self) -> Result<Vec<ContentHash>> {
        self.cache.get_leaf_hashes().await
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> Result<u64> {
        self.cache.get_message_count().await
    }

    /// A page of abbreviated messages in (height, hash) order.
    pub async fn query(&self, cursor: &Cursor, is_backward: bool, limit: usize) -> Result<QueryPage> {
        self.cache.query(cursor, is_backward, limit).await
    }

    /// Encrypted messages for `hashes`, in request order, up to the response
    /// budget. Returns the messages and how many request entries were
    /// consumed; missing hashes count as consumed.
    pub async fn bulk(&self, hashes: &[ContentHash]) -> Result<(Vec<EncryptedMessage>, usize)> {
        let stored = self.cache.get_encrypted_messages(hashes).await?;
        let mut messages = Vec::new();
        let mut size = 0usize;
        let mut consumed = 0usize;
        for message in stored {
            if let Some(message) = message {
                let len = message.encoded_len();
                if !messages.is_empty() && size + len > MAX_BULK_RESPONSE_BYTES {
                    break;
                }
                size += len;
                messages.push(message);
            }
            consumed += 1;
        }
        Ok((messages, consumed))
    }

    /// Every message, decrypted, in (height, hash) order.
    pub async fn messages_ordered(&self) -> Result<Vec<(ContentHash, Arc<Message>)>> {
        let page_size = MAX_QUERY_LIMIT as usize;
        let mut hashes = Vec::new();
        let mut cursor = Cursor::Height(0);
        loop {
            let page = self.query(&cursor, false, page_size).await?;
            hashes.extend(page.messages.iter().map(|m| m.hash));
            match page.forward_hash {
                Some(next) => cursor = Cursor::Hash(next),
                None => break,
            }
        }

        let mut out = Vec::with_capacity(hashes.len());
        for (hash, message) in hashes.iter().zip(self.cache.get_messages(&hashes).await?) {
            let message = message.ok_or_else(|| Error::storage(format!("Message {} vanished", hash)))?;
            out.push((*hash, message));
        }
        Ok(out)
    }

    /// Receives the hash of every message appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ContentHash> {
        self.events.subscribe()
    }
}
