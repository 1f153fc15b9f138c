//! Message persistence.
//!
//! ## Modules
//!
//! - `backend`: the [`StorageBackend`] contract and its record types
//! - `memory`: in-memory backend
//! - `rocksdb`: RocksDB utilities and the persistent backend
//! - `cache`: per-channel LRU and memo layer used by channels

pub mod backend;
pub mod cache;
pub mod memory;
pub mod rocksdb;

pub use backend::{AbbreviatedMessage, Cursor, QueryPage, StorageBackend, StoredMessage};
pub use cache::{StorageCache, DEFAULT_CACHE_CAPACITY};
pub use memory::MemoryBackend;
pub use rocksdb::{composite_key, RocksDbBackend, RocksDbConfig, RocksDbHandle};
