//! Utility functions for CLI operations.

use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::storage::{RocksDbBackend, RocksDbConfig, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// Entity type under which the local identity is stored.
pub const IDENTITY_ENTITY: &str = "identity";
const IDENTITY_KEY: &str = "local";

/// Everything a command needs to open the node's state.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub rocksdb: RocksDbConfig,
    pub protocol: ProtocolConfig,
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            rocksdb: RocksDbConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }

    /// Tuning for a long-running `serve`.
    pub fn for_server(mut self) -> Self {
        self.rocksdb = RocksDbConfig::for_server();
        self
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

/// Opens (creating if needed) the node's database.
pub fn open_backend(config: &NodeConfig) -> Result<Arc<dyn StorageBackend>> {
    if !config.data_dir.exists() {
        fs::create_dir_all(&config.data_dir)?;
    }
    let backend = RocksDbBackend::open(config.db_path(), &config.rocksdb)?;
    Ok(Arc::new(backend))
}

/// Loads the local identity, failing if `init` has not run.
pub async fn load_identity(backend: &dyn StorageBackend) -> Result<Identity> {
    let bytes = backend
        .retrieve_entity(IDENTITY_ENTITY, IDENTITY_KEY)
        .await?
        .ok_or_else(|| Error::config("No identity found, run `dagchat init <name>` first"))?;
    Identity::from_bytes(&bytes)
}

/// Persists the local identity with the chains it holds.
pub async fn save_identity(backend: &dyn StorageBackend, identity: &Identity) -> Result<()> {
    backend
        .store_entity(IDENTITY_ENTITY, IDENTITY_KEY, &identity.to_bytes()?)
        .await
}

/// Whether an identity is already stored.
pub async fn has_identity(backend: &dyn StorageBackend) -> Result<bool> {
    Ok(backend
        .retrieve_entity(IDENTITY_ENTITY, IDENTITY_KEY)
        .await?
        .is_some())
}

/// Format Unix timestamp as human-readable string
pub fn format_timestamp(timestamp: u64) -> String {
    let datetime = UNIX_EPOCH + Duration::from_secs(timestamp);

    // Basic timestamp formatting for CLI display
    format!("{:?}", datetime)
}

/// Whether `path` looks like an initialized data directory.
pub fn is_initialized(path: &Path) -> bool {
    path.join("db").exists()
}
