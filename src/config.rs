//! Runtime configuration.
//!
//! Plain structs with defaults suitable for a single node. Wire limits that
//! both ends must agree on live in [`crate::constants`] instead.

use crate::storage::DEFAULT_CACHE_CAPACITY;
use std::time::Duration;

/// Tuning for one sync agent.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Entries requested per query page.
    pub query_limit: u32,
    /// Hashes requested per bulk packet.
    pub bulk_limit: usize,
    /// Unresolved messages tolerated before a partial sync escalates to a
    /// full sync.
    pub max_unresolved: usize,
    /// How long to wait for a query or bulk response.
    pub response_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            query_limit: 128,
            bulk_limit: 64,
            max_unresolved: 256,
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide protocol settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Deadline for the Hello/Shake exchange.
    pub handshake_timeout: Duration,
    /// Decrypted messages cached per channel.
    pub cache_capacity: usize,
    /// Sync agent tuning.
    pub sync: SyncConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sync: SyncConfig::default(),
        }
    }
}
