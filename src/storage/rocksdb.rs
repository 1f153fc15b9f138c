//! RocksDB-backed storage.
//!
//! The first half of this module is a thin, domain-free wrapper around
//! RocksDB (configuration, key helpers, iteration). The second half is
//! [`RocksDbBackend`], which lays channel messages out in column families:
//!
//! | Column family | Key | Value |
//! |---|---|---|
//! | `messages` | `channel:hash` | bincode `StoredMessage` |
//! | `heights` | `channel:height_be hash` | empty |
//! | `leaves` | `channel:hash` | empty |
//! | `referenced` | `channel:hash` | empty |
//! | `entities` | `kind:key` | raw bytes |
//!
//! Big-endian heights make seek iteration over `heights` yield messages in
//! (height, hash) order.

use crate::dag::{ContentHash, HASH_SIZE};
use crate::error::{Error, Result};
use crate::storage::backend::{AbbreviatedMessage, Cursor, QueryPage, StorageBackend, StoredMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// =============================================================================
// RocksDB Configuration
// =============================================================================

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of open files.
    pub max_open_files: i32,
    /// Number of log files to keep.
    pub keep_log_file_num: usize,
    /// Maximum WAL size in bytes.
    pub max_wal_size: u64,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum number of write buffers.
    pub max_write_buffer_number: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_open_files: 128,
            keep_log_file_num: 2,
            max_wal_size: 32 * 1024 * 1024,      // 32MB
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            max_write_buffer_number: 2,
        }
    }
}

impl RocksDbConfig {
    /// Creates a configuration for long-running nodes serving many peers.
    pub fn for_server() -> Self {
        Self {
            max_open_files: 256,
            keep_log_file_num: 3,
            max_wal_size: 64 * 1024 * 1024,      // 64MB
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 3,
        }
    }

    /// Builds RocksDB Options from this configuration.
    pub fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(self.keep_log_file_num);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(self.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

// =============================================================================
// Key Generation Utilities
// =============================================================================

/// Creates a composite key from two byte slices.
///
/// Format: `{part1}:{part2}` (using colon separator)
pub fn composite_key(part1: &[u8], part2: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(part1.len() + 1 + part2.len());
    key.extend_from_slice(part1);
    key.push(b':');
    key.extend_from_slice(part2);
    key
}

// =============================================================================
// Database Handle Wrapper
// =============================================================================

/// One write in an atomic batch.
pub enum BatchOp<'a> {
    Put {
        cf: &'a str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'a str,
        key: Vec<u8>,
    },
}

/// A wrapper around RocksDB that provides common operations.
pub struct RocksDbHandle {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksDbHandle {
    /// Opens a RocksDB database with the given column families.
    pub fn open(
        db_path: impl AsRef<Path>,
        config: &RocksDbConfig,
        column_families: &[&str],
    ) -> Result<Self> {
        let opts = config.build_options();
        let cf_opts = Options::default();

        let cf_descriptors: Vec<_> = column_families
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, cf_opts.clone()))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            db_path.as_ref(),
            cf_descriptors,
        )
        .map_err(|e| Error::storage(format!("Failed to open RocksDB: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Gets a column family handle.
    pub fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::storage(format!("Column family '{}' not found", name)))
    }

    /// Stores raw bytes at the given key.
    pub fn put_raw(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;

        trace!(
            cf = cf_name,
            key_len = key.len(),
            value_bytes = value.len(),
            "db_put_raw: storing raw bytes"
        );

        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| Error::storage(format!("Failed to write: {}", e)))
    }

    /// Loads and deserializes a value from the given key.
    pub fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(cf_name, key)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::serialization(format!("Failed to deserialize: {}", e))),
            None => Ok(None),
        }
    }

    /// Loads raw bytes from the given key.
    pub fn get_raw(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;

        match self.db.get_cf(&cf, key) {
            Ok(Some(bytes)) => {
                trace!(
                    cf = cf_name,
                    key_len = key.len(),
                    value_bytes = bytes.len(),
                    "db_get_raw: found record"
                );
                Ok(Some(bytes))
            }
            Ok(None) => {
                trace!(cf = cf_name, key_len = key.len(), "db_get_raw: key not found");
                Ok(None)
            }
            Err(e) => Err(Error::storage(format!("Failed to read: {}", e))),
        }
    }

    /// Checks if a key exists.
    pub fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_pinned_cf(&cf, key)
            .map(|v| v.is_some())
            .map_err(|e| Error::storage(format!("Failed to check key: {}", e)))
    }

    /// Deletes a key.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;

        trace!(cf = cf_name, key_len = key.len(), "db_delete: deleting key");

        self.db
            .delete_cf(&cf, key)
            .map_err(|e| Error::storage(format!("Failed to delete: {}", e)))
    }

    /// Applies a set of writes atomically.
    pub fn write_batch(&self, ops: Vec<BatchOp<'_>>) -> Result<()> {
        let mut batch = WriteBatch::default();
        let count = ops.len();
        for op in ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = self.cf(cf)?;
                    batch.put_cf(&handle, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = self.cf(cf)?;
                    batch.delete_cf(&handle, key);
                }
            }
        }

        trace!(operations = count, "db_write_batch: applying batch");

        self.db
            .write(batch)
            .map_err(|e| Error::storage(format!("Failed to write batch: {}", e)))
    }

    /// Iterates over all entries with the given prefix.
    ///
    /// The callback receives (key, value) pairs and should return true to continue
    /// or false to stop iteration.
    pub fn prefix_iterate<F>(&self, cf_name: &str, prefix: &[u8], callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.seek_iterate(cf_name, prefix, prefix, callback)
    }

    /// Iterates forward from `seek_key`, stopping at the first key outside
    /// `filter_prefix`.
    pub fn seek_iterate<F>(
        &self,
        cf_name: &str,
        seek_key: &[u8],
        filter_prefix: &[u8],
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        iter.seek(seek_key);

        let mut count: usize = 0;
        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                if !key.starts_with(filter_prefix) {
                    break;
                }
                count += 1;
                if !callback(key, value) {
                    break;
                }
                iter.next();
            } else {
                break;
            }
        }
        if let Err(e) = iter.status() {
            warn!("Iterator error: {}", e);
        }

        trace!(
            cf = cf_name,
            seek_key_len = seek_key.len(),
            records_iterated = count,
            "db_seek_iterate: completed seek iteration"
        );

        Ok(())
    }

    /// Iterates backward over keys strictly before `seek_key`, stopping at the
    /// first key outside `filter_prefix`.
    pub fn seek_iterate_reverse<F>(
        &self,
        cf_name: &str,
        seek_key: &[u8],
        filter_prefix: &[u8],
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        iter.seek_for_prev(seek_key);
        if iter.valid() && iter.key() == Some(seek_key) {
            iter.prev();
        }

        let mut count: usize = 0;
        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                if !key.starts_with(filter_prefix) {
                    break;
                }
                count += 1;
                if !callback(key, value) {
                    break;
                }
                iter.prev();
            } else {
                break;
            }
        }

        trace!(
            cf = cf_name,
            seek_key_len = seek_key.len(),
            records_iterated = count,
            "db_seek_iterate_reverse: completed reverse iteration"
        );

        Ok(())
    }

    /// Deletes all entries with the given prefix.
    ///
    /// Returns the number of deleted entries.
    pub fn prefix_delete(&self, cf_name: &str, prefix: &[u8]) -> Result<usize> {
        let mut keys = Vec::new();
        self.prefix_iterate(cf_name, prefix, |key, _| {
            keys.push(key.to_vec());
            true
        })?;

        let deleted = keys.len();
        self.write_batch(
            keys.into_iter()
                .map(|key| BatchOp::Delete { cf: cf_name, key })
                .collect(),
        )?;

        debug!(
            cf = cf_name,
            prefix_len = prefix.len(),
            records_deleted = deleted,
            "db_prefix_delete: deleted records with prefix"
        );

        Ok(deleted)
    }
}

impl std::fmt::Debug for RocksDbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbHandle")
            .field("db", &"RocksDB")
            .finish()
    }
}

// =============================================================================
// Channel Storage Backend
// =============================================================================

const CF_MESSAGES: &str = "messages";
const CF_HEIGHTS: &str = "heights";
const CF_LEAVES: &str = "leaves";
const CF_REFERENCED: &str = "referenced";
const CF_ENTITIES: &str = "entities";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_HEIGHTS, CF_LEAVES, CF_REFERENCED, CF_ENTITIES];

fn channel_prefix(channel_id: &ContentHash) -> Vec<u8> {
    composite_key(channel_id.as_bytes(), &[])
}

fn message_key(channel_id: &ContentHash, hash: &ContentHash) -> Vec<u8> {
    composite_key(channel_id.as_bytes(), hash.as_bytes())
}

fn height_key(channel_id: &ContentHash, height: u64, hash: Option<&ContentHash>) -> Vec<u8> {
    let mut suffix = height.to_be_bytes().to_vec();
    if let Some(hash) = hash {
        suffix.extend_from_slice(hash.as_bytes());
    }
    composite_key(channel_id.as_bytes(), &suffix)
}

fn hash_suffix(key: &[u8]) -> Result<ContentHash> {
    if key.len() < HASH_SIZE {
        return Err(Error::storage("Index key too short"));
    }
    ContentHash::from_slice(&key[key.len() - HASH_SIZE..])
}

/// [`StorageBackend`] persisted in RocksDB.
pub struct RocksDbBackend {
    db: RocksDbHandle,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend").field("db", &self.db).finish()
    }
}

impl RocksDbBackend {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>, config: &RocksDbConfig) -> Result<Self> {
        let db = RocksDbHandle::open(path, config, COLUMN_FAMILIES)?;
        debug!("Opened RocksDB channel storage");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn height_of(&self, channel_id: &ContentHash, hash: &ContentHash) -> Result<Option<u64>> {
        let stored: Option<StoredMessage> = self.db.get(CF_MESSAGES, &message_key(channel_id, hash))?;
        Ok(stored.map(|m| m.height))
    }

    fn abbreviated(&self, channel_id: &ContentHash, hash: &ContentHash) -> Result<Option<AbbreviatedMessage>> {
        let stored: Option<StoredMessage> = self.db.get(CF_MESSAGES, &message_key(channel_id, hash))?;
        Ok(stored.map(|m| m.abbreviate()))
    }

    /// Collects up to `limit` hashes from the height index.
    fn index_scan(
        &self,
        channel_id: &ContentHash,
        seek_key: &[u8],
        backward: bool,
        limit: usize,
    ) -> Result<Vec<ContentHash>> {
        let prefix = channel_prefix(channel_id);
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let collect = |key: &[u8], _: &[u8]| {
            keys.push(key.to_vec());
            keys.len() < limit
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        if backward {
            self.db.seek_iterate_reverse(CF_HEIGHTS, seek_key, &prefix, collect)?;
        } else {
            self.db.seek_iterate(CF_HEIGHTS, seek_key, &prefix, collect)?;
        }
        keys.iter().map(|k| hash_suffix(k)).collect()
    }
}

#[async_trait]
impl StorageBackend for RocksDbBackend {
    async fn add_message(&self, message: StoredMessage) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let channel_id = message.channel_id;
        let key = message_key(&channel_id, &message.hash);
        if self.db.exists(CF_MESSAGES, &key)? {
            return Ok(false);
        }

        let mut ops = Vec::with_capacity(message.parents.len() * 2 + 3);
        for parent in &message.parents {
            let parent_key = message_key(&channel_id, parent);
            ops.push(BatchOp::Put {
                cf: CF_REFERENCED,
                key: parent_key.clone(),
                value: Vec::new(),
            });
            ops.push(BatchOp::Delete {
                cf: CF_LEAVES,
                key: parent_key,
            });
        }
        if !self.db.exists(CF_REFERENCED, &key)? {
            ops.push(BatchOp::Put {
                cf: CF_LEAVES,
                key: key.clone(),
                value: Vec::new(),
            });
        }
        ops.push(BatchOp::Put {
            cf: CF_HEIGHTS,
            key: height_key(&channel_id, message.height, Some(&message.hash)),
            value: Vec::new(),
        });
        let value = bincode::serialize(&message)
            .map_err(|e| Error::serialization(format!("Failed to serialize message: {}", e)))?;
        ops.push(BatchOp::Put {
            cf: CF_MESSAGES,
            key,
            value,
        });

        self.db.write_batch(ops)?;
        trace!(hash = %message.hash, height = message.height, "rocksdb: add_message");
        Ok(true)
    }

    async fn has_message(&self, channel_id: &ContentHash, hash: &ContentHash) -> Result<bool> {
        self.db.exists(CF_MESSAGES, &message_key(channel_id, hash))
    }

    async fn get_message(
        &self,
        channel_id: &ContentHash,
        hash: &ContentHash,
    ) -> Result<Option<StoredMessage>> {
        self.db.get(CF_MESSAGES, &message_key(channel_id, hash))
    }

    async fn get_leaf_hashes(&self, channel_id: &ContentHash) -> Result<Vec<ContentHash>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        self.db
            .prefix_iterate(CF_LEAVES, &channel_prefix(channel_id), |key, _| {
                keys.push(key.to_vec());
                true
            })?;
        keys.iter().map(|k| hash_suffix(k)).collect()
    }

    async fn get_message_count(&self, channel_id: &ContentHash) -> Result<u64> {
        let mut count = 0u64;
        self.db
            .prefix_iterate(CF_HEIGHTS, &channel_prefix(channel_id), |_, _| {
                count += 1;
                true
            })?;
        Ok(count)
    }

    async fn query(
        &self,
        channel_id: &ContentHash,
        cursor: &Cursor,
        is_backward: bool,
        limit: usize,
    ) -> Result<QueryPage> {
        let seek_key = match cursor {
            Cursor::Height(height) => height_key(channel_id, *height, None),
            Cursor::Hash(hash) => match self.height_of(channel_id, hash)? {
                Some(height) => height_key(channel_id, height, Some(hash)),
                None => return Ok(QueryPage::default()),
            },
        };

        let (hashes, forward_hash, backward_hash) = if is_backward {
            let mut before = self.index_scan(channel_id, &seek_key, true, limit + 1)?;
            let more_before = before.len() > limit;
            before.truncate(limit);
            before.reverse();
            let forward_hash = self.index_scan(channel_id, &seek_key, false, 1)?.first().copied();
            let backward_hash = if more_before { before.first().copied() } else { None };
            (before, forward_hash, backward_hash)
        } else {
            let mut after = self.index_scan(channel_id, &seek_key, false, limit + 1)?;
            let forward_hash = if after.len() > limit { after.pop() } else { None };
            let has_before = !self.index_scan(channel_id, &seek_key, true, 1)?.is_empty();
            let backward_hash = if has_before { after.first().copied() } else { None };
            (after, forward_hash, backward_hash)
        };

        let mut messages = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            match self.abbreviated(channel_id, hash)? {
                Some(message) => messages.push(message),
                None => warn!(hash = %hash, "rocksdb: height index points at missing message"),
            }
        }

        Ok(QueryPage {
            messages,
            forward_hash,
            backward_hash,
        })
    }

    async fn remove_channel_messages(&self, channel_id: &ContentHash) -> Result<()> {
        let _guard = self.write_lock.lock();
        let prefix = channel_prefix(channel_id);
        let mut deleted = 0;
        for cf in [CF_MESSAGES, CF_HEIGHTS, CF_LEAVES, CF_REFERENCED] {
            deleted += self.db.prefix_delete(cf, &prefix)?;
        }
        debug!(channel = %channel_id, records_deleted = deleted, "rocksdb: removed channel");
        Ok(())
    }

    async fn store_entity(&self, kind: &str, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put_raw(CF_ENTITIES, &composite_key(kind.as_bytes(), key.as_bytes()), value)
    }

    async fn retrieve_entity(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get_raw(CF_ENTITIES, &composite_key(kind.as_bytes(), key.as_bytes()))
    }

    async fn remove_entity(&self, kind: &str, key: &str) -> Result<()> {
        self.db
            .delete(CF_ENTITIES, &composite_key(kind.as_bytes(), key.as_bytes()))
    }

    async fn get_entity_keys(&self, kind: &str) -> Result<Vec<String>> {
        let prefix = composite_key(kind.as_bytes(), &[]);
        let mut keys = Vec::new();
        self.db.prefix_iterate(CF_ENTITIES, &prefix, |key, _| {
            match std::str::from_utf8(&key[prefix.len()..]) {
                Ok(k) => keys.push(k.to_string()),
                Err(_) => warn!("rocksdb: skipping non-UTF-8 entity key"),
            }
            true
        })?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: u64,
    }

    fn create_test_db() -> (RocksDbHandle, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test_db");
        let config = RocksDbConfig::default();
        let db =
            RocksDbHandle::open(&db_path, &config, &["data", "meta"]).expect("Failed to open db");
        (db, temp_dir)
    }

    #[test]
    fn test_composite_key() {
        let key = composite_key(b"part1", b"part2");
        assert_eq!(key, b"part1:part2");
    }

    #[test]
    fn test_put_and_get() {
        let (db, _temp) = create_test_db();

        let data = TestData {
            name: "Test".to_string(),
            value: 12345,
        };
        db.put_raw("data", b"key1", &bincode::serialize(&data).unwrap())
            .unwrap();

        let loaded: TestData = db.get("data", b"key1").unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_write_batch_and_prefix_delete() {
        let (db, _temp) = create_test_db();

        db.write_batch(vec![
            BatchOp::Put {
                cf: "data",
                key: b"prefix1:a".to_vec(),
                value: b"1".to_vec(),
            },
            BatchOp::Put {
                cf: "data",
                key: b"prefix1:b".to_vec(),
                value: b"2".to_vec(),
            },
            BatchOp::Put {
                cf: "data",
                key: b"prefix2:a".to_vec(),
                value: b"3".to_vec(),
            },
        ])
        .unwrap();

        assert_eq!(db.prefix_delete("data", b"prefix1:").unwrap(), 2);
        assert!(db.exists("data", b"prefix2:a").unwrap());
        assert!(!db.exists("data", b"prefix1:a").unwrap());
    }

    #[test]
    fn test_seek_iterate_reverse_excludes_seek_key() {
        let (db, _temp) = create_test_db();
        for k in [b"p:1", b"p:2", b"p:3"] {
            db.put_raw("data", k, b"").unwrap();
        }

        let mut seen = Vec::new();
        db.seek_iterate_reverse("data", b"p:3", b"p:", |key, _| {
            seen.push(key.to_vec());
            true
        })
        .unwrap();
        assert_eq!(seen, vec![b"p:2".to_vec(), b"p:1".to_vec()]);
    }

    #[test]
    fn test_server_config() {
        let config = RocksDbConfig::for_server();
        assert_eq!(config.max_open_files, 256);
        assert_eq!(config.max_wal_size, 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_rocksdb_backend_conformance() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = RocksDbBackend::open(temp_dir.path().join("db"), &RocksDbConfig::default())
            .expect("Failed to open backend");
        conformance::run_all(&backend).await;
    }
}
