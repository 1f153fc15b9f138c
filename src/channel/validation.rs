//! Validation rules for channel messages.
//!
//! Checks are split in two:
//! - structural rules that depend only on the message itself (parent list
//!   shape, root marker, body size and encoding);
//! - rules that depend on the resolved parents (height, timestamps).
//!
//! The same height and timestamp helpers are used when posting, so a locally
//! built message always passes its own validation.

use crate::channel::message::{MessageBody, MessageContent};
use crate::constants::{MAX_BODY_SIZE, MAX_FUTURE_SKEW_SECS, MAX_PARENTS, MAX_PARENT_DELTA_SECS};
use crate::error::{Error, Result};

/// Height and timestamp of a resolved parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentInfo {
    pub height: u64,
    pub timestamp: u64,
}

/// Result of validation containing detailed information.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors, if any.
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Creates a successful validation result.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Whether validation passed.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    /// Converts into a `Result`, joining all errors.
    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::validation(self.errors.join("; ")))
        }
    }
}

/// Body cap for a chain of `chain_length` links: 256KB, then a quarter of the
/// previous cap per link.
pub fn max_body_size(chain_length: usize) -> usize {
    MAX_BODY_SIZE >> (2 * chain_length.min(8))
}

/// Parents that count toward height and timestamp: those no more than
/// [`MAX_PARENT_DELTA_SECS`] older than the newest parent.
pub fn included_parents(parents: &[ParentInfo]) -> impl Iterator<Item = &ParentInfo> {
    let newest = parents.iter().map(|p| p.timestamp).max().unwrap_or(0);
    parents
        .iter()
        .filter(move |p| p.timestamp.saturating_add(MAX_PARENT_DELTA_SECS) >= newest)
}

/// Height a message with these parents must carry. Zero for the root.
pub fn expected_height(parents: &[ParentInfo]) -> u64 {
    included_parents(parents)
        .map(|p| p.height + 1)
        .max()
        .unwrap_or(0)
}

/// Earliest timestamp a message with these parents may carry.
pub fn min_timestamp(parents: &[ParentInfo]) -> u64 {
    included_parents(parents)
        .map(|p| p.timestamp)
        .max()
        .unwrap_or(0)
}

/// Validates the parts of a message that do not depend on its parents.
pub fn validate_structure(content: &MessageContent) -> ValidationResult {
    let mut result = ValidationResult::ok();

    if content.parents.len() > MAX_PARENTS {
        result.add_error(format!(
            "Too many parents: {} (max {})",
            content.parents.len(),
            MAX_PARENTS
        ));
    }
    if content.parents.windows(2).any(|w| w[0] >= w[1]) {
        result.add_error("Parents must be sorted and unique".to_string());
    }

    match (&content.body, content.parents.is_empty()) {
        (MessageBody::Root, true) => {
            if content.height != 0 {
                result.add_error(format!("Root height must be 0, got {}", content.height));
            }
            if !content.chain.is_empty() {
                result.add_error("Root must be signed by the channel key".to_string());
            }
        }
        (MessageBody::Root, false) => {
            result.add_error("Only a parentless message may carry the root body".to_string());
        }
        (MessageBody::Json(_), true) => {
            result.add_error("Parentless message must carry the root body".to_string());
        }
        (MessageBody::Json(_), false) => {}
    }

    let cap = max_body_size(content.chain.len());
    if content.body.size() > cap {
        result.add_error(format!(
            "Body too large for chain of length {}: {} bytes (max {})",
            content.chain.len(),
            content.body.size(),
            cap
        ));
    }
    if let Err(e) = content.body.to_value() {
        result.add_error(e.to_string());
    }

    result
}

/// Validates height and timestamp against the resolved parents.
pub fn validate_against_parents(
    content: &MessageContent,
    parents: &[ParentInfo],
    now: u64,
) -> ValidationResult {
    let mut result = ValidationResult::ok();

    let height = expected_height(parents);
    if content.height != height {
        result.add_error(format!(
            "Height mismatch: expected {}, got {}",
            height, content.height
        ));
    }

    if content.timestamp > now + MAX_FUTURE_SKEW_SECS {
        result.add_error(format!(
            "Timestamp {} too far in the future (now {})",
            content.timestamp, now
        ));
    }
    let earliest = min_timestamp(parents);
    if content.timestamp < earliest {
        result.add_error(format!(
            "Timestamp {} precedes parent timestamp {}",
            content.timestamp, earliest
        ));
    }

    result
}
