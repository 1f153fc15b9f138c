//! # dagchat - decentralized end-to-end encrypted group messaging
//!
//! Each channel is a replicated DAG of signed, encrypted messages. A channel
//! is rooted at one ML-DSA-87 key; anyone holding a delegation chain from
//! that key may post. Peers reconcile channels by walking each other's DAGs
//! and fetching what they lack.
//!
//! ## Layers
//!
//! - [`crypto`]: ML-DSA-87 signing, ML-KEM-1024 sealed boxes, AES-256-GCM
//!   channel encryption, SHA3-256 hashing
//! - [`identity`]: identities, links and delegation chains
//! - [`channel`]: message format, validation and the channel DAG
//! - [`storage`]: backend contract, in-memory and RocksDB backends, per-channel
//!   cache
//! - [`sync`]: the per-(peer, channel) reconciliation agent
//! - [`protocol`]: wire packets, peer sessions and invites
//! - [`transport`]: in-memory and TCP frame sockets
//!
//! ## Example
//!
//! ```rust,no_run
//! use dagchat::{Channel, Identity, MemoryBackend, Protocol, ProtocolConfig};
//! use std::sync::Arc;
//! # async fn demo() -> dagchat::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let alice = Identity::generate("alice")?;
//! let general = Channel::from_identity(&alice, "general", backend.clone(), 1024).await?;
//!
//! let node = Protocol::new(backend, ProtocolConfig::default());
//! let general = Arc::new(general);
//! node.add_channel(general.clone())?;
//! general
//!     .post(&serde_json::json!({ "text": "hello" }), &alice)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod cli;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod dag;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod storage;
pub mod sync;
pub mod transport;

pub use channel::{Channel, EncryptedMessage, Message, MessageBody, Received};
pub use config::{ProtocolConfig, SyncConfig};
pub use dag::ContentHash;
pub use error::{Error, Result};
pub use identity::{Chain, Identity, Link};
pub use protocol::{InvitePayload, InviteRequest, InviteSecret, Packet, PeerId, Protocol};
pub use storage::{MemoryBackend, RocksDbBackend, StorageBackend};
pub use sync::{SyncAgent, SyncState};
pub use transport::{MemorySocket, Socket, TcpSocket};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
