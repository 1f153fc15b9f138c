//! Error types for dagchat operations.
//!
//! Errors fall into three groups that callers treat differently:
//!
//! - **Recoverable** conditions (missing parent, sync timeout) drive the sync
//!   algorithm's backfill and retry paths and never reach the user.
//! - **Ban-worthy** violations (malformed packets, bad signatures, broken
//!   chains) end the connection to the peer that caused them.
//! - **Application** failures (no chain to post with, name collision) are
//!   returned to the caller, with capability problems kept apart from data
//!   problems.

use crate::dag::ContentHash;
use thiserror::Error;

/// Result type alias for dagchat operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dagchat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key generation or reconstruction errors
    #[error("Key error: {0}")]
    Key(String),

    /// Signature verification errors
    #[error("Signature error: {0}")]
    Signature(String),

    /// Delegation chain is malformed, expired or too long
    #[error("Chain error: {0}")]
    Chain(String),

    /// The identity lacks the delegation needed for the operation
    #[error("Capability error: {0}")]
    Capability(String),

    /// Structural validation of a message, link or packet failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// A parent referenced by a message is not known locally
    #[error("Parent not found: {0}")]
    ParentNotFound(ContentHash),

    /// A parentless message does not match the established channel root
    #[error("Root mismatch: expected {expected}, got {actual}")]
    RootMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Wire protocol violation by the remote peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer closed the session with an error packet
    #[error("Remote error: {0}")]
    Remote(String),

    /// A sync response did not arrive in time
    #[error("Sync timed out")]
    SyncTimeout,

    /// A sync pass could not converge
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// Socket receive timed out
    #[error("Timed out")]
    Timeout,

    /// Socket or session is closed
    #[error("Connection closed")]
    Closed,

    /// A channel with the same name or id is already registered
    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    /// Requested channel is not known
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Target peer is not connected
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Persistence backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new cryptographic error.
    pub fn crypto<T: ToString>(msg: T) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Creates a new key error.
    pub fn key<T: ToString>(msg: T) -> Self {
        Self::Key(msg.to_string())
    }

    /// Creates a new signature error.
    pub fn signature<T: ToString>(msg: T) -> Self {
        Self::Signature(msg.to_string())
    }

    /// Creates a new chain error.
    pub fn chain<T: ToString>(msg: T) -> Self {
        Self::Chain(msg.to_string())
    }

    /// Creates a new capability error.
    pub fn capability<T: ToString>(msg: T) -> Self {
        Self::Capability(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new protocol error.
    pub fn protocol<T: ToString>(msg: T) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Creates a new sync failure.
    pub fn sync_failed<T: ToString>(msg: T) -> Self {
        Self::SyncFailed(msg.to_string())
    }

    /// Creates a new storage error.
    pub fn storage<T: ToString>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Creates a new serialization error.
    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Returns true if this error must terminate the connection to the peer
    /// whose data caused it.
    pub fn is_ban_worthy(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Validation(_)
                | Error::Signature(_)
                | Error::Chain(_)
                | Error::Key(_)
                | Error::Crypto(_)
                | Error::RootMismatch { .. }
                | Error::Serialization(_)
        )
    }

    /// Returns true for conditions handled by retry or backfill.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ParentNotFound(_) | Error::SyncTimeout | Error::Timeout
        )
    }

    /// Returns true if the caller lacks the delegation to act, as opposed to
    /// supplying invalid data.
    pub fn is_capability(&self) -> bool {
        matches!(self, Error::Capability(_))
    }
}
