//! Per-channel read cache over a [`StorageBackend`].
//!
//! Decrypted messages are kept in an LRU keyed by hash. The message count and
//! leaf set are memoized and dropped on every insert. A generation counter
//! guards the memos: a value computed while an insert was in flight is
//! returned to the caller but not stored.

use crate::channel::message::{EncryptedMessage, Message};
use crate::crypto::ChannelCipher;
use crate::dag::ContentHash;
use crate::error::Result;
use crate::storage::backend::{Cursor, QueryPage, StorageBackend, StoredMessage};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default number of decrypted messages kept per channel.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Memoizing view of one channel's storage.
pub struct StorageCache {
    backend: Arc<dyn StorageBackend>,
    channel_id: ContentHash,
    cipher: ChannelCipher,
    messages: Mutex<LruCache<ContentHash, Arc<Message>>>,
    count: Mutex<Option<u64>>,
    leaves: Mutex<Option<Vec<ContentHash>>>,
    generation: AtomicU64,
}

impl fmt::Debug for StorageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCache")
            .field("channel_id", &self.channel_id)
            .field("cached", &self.messages.lock().len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl StorageCache {
    /// Creates a cache for `channel_id`. A capacity of zero is treated as one.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        channel_id: ContentHash,
        cipher: ChannelCipher,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            channel_id,
            cipher,
            messages: Mutex::new(LruCache::new(capacity)),
            count: Mutex::new(None),
            leaves: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// The channel this cache serves.
    pub fn channel_id(&self) -> &ContentHash {
        &self.channel_id
    }

    /// Cipher used to decrypt stored messages.
    pub fn cipher(&self) -> &ChannelCipher {
        &self.cipher
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.count.lock() = None;
        *self.leaves.lock() = None;
    }

    /// Persists a validated message. Returns `false` if it was already stored.
    pub async fn add_message(
        &self,
        hash: ContentHash,
        message: Arc<Message>,
        encrypted: &EncryptedMessage,
    ) -> Result<bool> {
        let stored = StoredMessage {
            channel_id: self.channel_id,
            hash,
            parents: message.parents().to_vec(),
            height: message.height(),
            data: encrypted.to_bytes()?,
        };

        // Bump before the write so concurrent readers see the change coming
        self.generation.fetch_add(1, Ordering::SeqCst);
        let inserted = self.backend.add_message(stored).await?;
        self.invalidate();

        self.messages.lock().put(hash, message);
        trace!(hash = %hash, inserted, "cache: add_message");
        Ok(inserted)
    }

    /// Checks whether a message is stored.
    pub async fn has_message(&self, hash: &ContentHash) -> Result<bool> {
        if self.messages.lock().contains(hash) {
            return Ok(true);
        }
        self.backend.has_message(&self.channel_id, hash).await
    }

    fn decode(&self, stored: StoredMessage) -> Result<Arc<Message>> {
        let message = Arc::new(EncryptedMessage::from_bytes(&stored.data)?.decrypt(&self.cipher)?);
        self.messages.lock().put(stored.hash, Arc::clone(&message));
        Ok(message)
    }

    /// Loads and decrypts a message.
    pub async fn get_message(&self, hash: &ContentHash) -> Result<Option<Arc<Message>>> {
        if let Some(message) = self.messages.lock().get(hash) {
            return Ok(Some(Arc::clone(message)));
        }
        match self.backend.get_message(&self.channel_id, hash).await? {
            Some(stored) => self.decode(stored).map(Some),
            None => Ok(None),
        }
    }

    /// Loads several messages, preserving order. Cache misses are fetched
    /// from the backend in one call.
    pub async fn get_messages(&self, hashes: &[ContentHash]) -> Result<Vec<Option<Arc<Message>>>> {
        let mut out: Vec<Option<Arc<Message>>> = Vec::with_capacity(hashes.len());
        let mut missing = Vec::new();
        {
            let mut cache = self.messages.lock();
            for (i, hash) in hashes.iter().enumerate() {
                let hit = cache.get(hash).cloned();
                if hit.is_none() {
                    missing.push((i, *hash));
                }
                out.push(hit);
            }
        }

        if !missing.is_empty() {
            let wanted: Vec<ContentHash> = missing.iter().map(|(_, h)| *h).collect();
            let fetched = self.backend.get_messages(&self.channel_id, &wanted).await?;
            for ((i, _), stored) in missing.into_iter().zip(fetched) {
                if let Some(stored) = stored {
                    out[i] = Some(self.decode(stored)?);
                }
            }
        }
        Ok(out)
    }

    /// Loads messages in their stored encrypted form, preserving order.
    pub async fn get_encrypted_messages(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<Option<EncryptedMessage>>> {
        self.backend
            .get_messages(&self.channel_id, hashes)
            .await?
            .into_iter()
            .map(|stored| stored.map(|s| EncryptedMessage::from_bytes(&s.data)).transpose())
            .collect()
    }

    /// Current leaf hashes, sorted.
    pub async fn get_leaf_hashes(&self) -> Result<Vec<ContentHash>> {
        if let Some(leaves) = self.leaves.lock().as_ref() {
            return Ok(leaves.clone());
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let leaves = self.backend.get_leaf_hashes(&self.channel_id).await?;
        if self.generation.load(Ordering::SeqCst) == generation {
            *self.leaves.lock() = Some(leaves.clone());
        }
        Ok(leaves)
    }

    /// Number of stored messages.
    pub async fn get_message_count(&self) -> Result<u64> {
        if let Some(count) = *self.count.lock() {
            return Ok(count);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let count = self.backend.get_message_count(&self.channel_id).await?;
        if self.generation.load(Ordering::SeqCst) == generation {
            *self.count.lock() = Some(count);
        }
        Ok(count)
    }

    /// Paginated query, passed straight to the backend.
    pub async fn query(&self, cursor: &Cursor, is_backward: bool, limit: usize) -> Result<QueryPage> {
        self.backend
            .query(&self.channel_id, cursor, is_backward, limit)
            .await
    }
}
