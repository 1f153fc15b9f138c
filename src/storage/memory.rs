//! In-memory storage backend.
//!
//! Keeps every channel in ordered maps behind a single lock. Used by tests and
//! by nodes that do not need persistence.

use crate::dag::ContentHash;
use crate::error::Result;
use crate::storage::backend::{AbbreviatedMessage, Cursor, QueryPage, StorageBackend, StoredMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use tracing::trace;

#[derive(Default)]
struct ChannelMessages {
    messages: HashMap<ContentHash, StoredMessage>,
    ordered: BTreeSet<(u64, ContentHash)>,
    leaves: BTreeSet<ContentHash>,
    referenced: HashSet<ContentHash>,
}

impl ChannelMessages {
    fn insert(&mut self, message: StoredMessage) -> bool {
        if self.messages.contains_key(&message.hash) {
            return false;
        }
        for parent in &message.parents {
            self.referenced.insert(*parent);
            self.leaves.remove(parent);
        }
        if !self.referenced.contains(&message.hash) {
            self.leaves.insert(message.hash);
        }
        self.ordered.insert((message.height, message.hash));
        self.messages.insert(message.hash, message);
        true
    }

    fn position(&self, cursor: &Cursor) -> Option<(u64, ContentHash)> {
        match cursor {
            Cursor::Height(height) => Some((*height, ContentHash::MIN)),
            Cursor::Hash(hash) => self.messages.get(hash).map(|m| (m.height, *hash)),
        }
    }

    fn abbreviate(&self, key: &(u64, ContentHash)) -> Option<AbbreviatedMessage> {
        self.messages.get(&key.1).map(StoredMessage::abbreviate)
    }

    fn query(&self, cursor: &Cursor, is_backward: bool, limit: usize) -> QueryPage {
        let Some(key) = self.position(cursor) else {
            return QueryPage::default();
        };

        if is_backward {
            let before: Vec<&(u64, ContentHash)> = self
                .ordered
                .range((Bound::Unbounded, Bound::Excluded(key)))
                .rev()
                .take(limit + 1)
                .collect();
            let more_before = before.len() > limit;
            let messages: Vec<_> = before
                .into_iter()
                .take(limit)
                .rev()
                .filter_map(|k| self.abbreviate(k))
                .collect();
            let forward_hash = self.ordered.range(key..).next().map(|(_, h)| *h);
            let backward_hash = if more_before {
                messages.first().map(|m| m.hash)
            } else {
                None
            };
            QueryPage {
                messages,
                forward_hash,
                backward_hash,
            }
        } else {
            let mut after = self.ordered.range(key..);
            let messages: Vec<_> = after
                .by_ref()
                .take(limit)
                .filter_map(|k| self.abbreviate(k))
                .collect();
            let forward_hash = after.next().map(|(_, h)| *h);
            let has_before = self
                .ordered
                .range((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .is_some();
            let backward_hash = if has_before {
                messages.first().map(|m| m.hash)
            } else {
                None
            };
            QueryPage {
                messages,
                forward_hash,
                backward_hash,
            }
        }
    }
}

/// Storage backend held entirely in memory.
#[derive(Default)]
pub struct MemoryBackend {
    channels: RwLock<HashMap<ContentHash, ChannelMessages>>,
    entities: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn add_message(&self, message: StoredMessage) -> Result<bool> {
        let hash = message.hash;
        let mut channels = self.channels.write();
        let inserted = channels
            .entry(message.channel_id)
            .or_default()
            .insert(message);
        trace!(hash = %hash, inserted, "memory: add_message");
        Ok(inserted)
    }

    async fn has_message(&self, channel_id: &ContentHash, hash: &ContentHash) -> Result<bool> {
        Ok(self
            .channels
            .read()
            .get(channel_id)
            .is_some_and(|c| c.messages.contains_key(hash)))
    }

    async fn get_message(
        &self,
        channel_id: &ContentHash,
        hash: &ContentHash,
    ) -> Result<Option<StoredMessage>> {
        Ok(self
            .channels
            .read()
            .get(channel_id)
            .and_then(|c| c.messages.get(hash).cloned()))
    }

    async fn get_messages(
        &self,
        channel_id: &ContentHash,
        hashes: &[ContentHash],
    ) -> Result<Vec<Option<StoredMessage>>> {
        let channels = self.channels.read();
        let channel = channels.get(channel_id);
        Ok(hashes
            .iter()
            .map(|h| channel.and_then(|c| c.messages.get(h).cloned()))
            .collect())
    }

    async fn get_leaf_hashes(&self, channel_id: &ContentHash) -> Result<Vec<ContentHash>> {
        Ok(self
            .channels
            .read()
            .get(channel_id)
            .map(|c| c.leaves.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_message_count(&self, channel_id: &ContentHash) -> Result<u64> {
        Ok(self
            .channels
            .read()
            .get(channel_id)
            .map(|c| c.messages.len() as u64)
            .unwrap_or(0))
    }

    async fn query(
        &self,
        channel_id: &ContentHash,
        cursor: &Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QueryPage> {
        Ok(self
            .channels
            .read()
            .get(channel_id)
            .map(|c| c.query(cursor, is_backward, limit))
            .unwrap_or_default())
    }

    async fn remove_channel_messages(&self, channel_id: &ContentHash) -> Result<()> {
        self.channels.write().remove(channel_id);
        Ok(())
    }

    async fn store_entity(&self, kind: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entities
            .write()
            .insert((kind.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn retrieve_entity(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entities
            .read()
            .get(&(kind.to_string(), key.to_string()))
            .cloned())
    }

    async fn remove_entity(&self, kind: &str, key: &str) -> Result<()> {
        self.entities
            .write()
            .remove(&(kind.to_string(), key.to_string()));
        Ok(())
    }

    async fn get_entity_keys(&self, kind: &str) -> Result<Vec<String>> {
        Ok(self
            .entities
            .read()
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
