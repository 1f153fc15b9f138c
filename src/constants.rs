//! Shared protocol constants.
//!
//! Both ends of a connection validate against these, so changing any of them
//! is a wire-compatibility break and requires bumping [`PROTOCOL_VERSION`].

// =============================================================================
// Protocol
// =============================================================================

/// Wire protocol version exchanged in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Trust Delegation
// =============================================================================

/// Maximum number of links in a delegation chain.
pub const MAX_CHAIN_LENGTH: usize = 3;

/// Maximum trustee display name size (128 bytes).
pub const MAX_DISPLAY_NAME_SIZE: usize = 128;

/// Clock skew tolerance applied when deciding whether a chain stays usable
/// (5 minutes in seconds). Never applied when verifying signatures.
pub const CHAIN_LEEWAY_SECS: u64 = 5 * 60;

/// Default link lifetime when the issuer does not pick one (90 days).
pub const DEFAULT_LINK_LIFETIME_SECS: u64 = 90 * 24 * 3600;

// =============================================================================
// Message Limits
// =============================================================================

/// Body size cap for messages posted with an empty chain (256KB).
/// Every additional link divides the cap by four.
pub const MAX_BODY_SIZE: usize = 256 * 1024;

/// Maximum number of parents a message may reference.
pub const MAX_PARENTS: usize = 50;

/// Parents older than this relative to the newest parent are excluded from
/// height and timestamp computation (30 days in seconds).
pub const MAX_PARENT_DELTA_SECS: u64 = 30 * 24 * 3600;

/// Maximum allowed future clock skew for message timestamps (5 minutes).
pub const MAX_FUTURE_SKEW_SECS: u64 = 5 * 60;

/// Maximum channel name size (128 bytes).
pub const MAX_CHANNEL_NAME_SIZE: usize = 128;

/// Maximum size of an encrypted message ciphertext (512KB).
pub const MAX_CIPHERTEXT_SIZE: usize = 512 * 1024;

// =============================================================================
// Sync Protocol Limits
// =============================================================================

/// Maximum entries a query may request or a query response may carry.
pub const MAX_QUERY_LIMIT: u32 = 1024;

/// Maximum hashes in one bulk request and messages in one bulk response.
pub const MAX_BULK_COUNT: usize = 128;

/// Soft cap on the total ciphertext carried by one bulk response (1MB).
/// At least one message is always returned.
pub const MAX_BULK_RESPONSE_BYTES: usize = 1024 * 1024;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum size of one framed packet (2MB).
pub const MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

/// Maximum length of an error reason (256 bytes).
pub const MAX_ERROR_REASON_SIZE: usize = 256;

/// Maximum size of a sealed invite box (64KB).
pub const MAX_SEALED_BOX_SIZE: usize = 64 * 1024;
