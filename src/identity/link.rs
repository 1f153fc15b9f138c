//! Signed delegation links.
//!
//! A link says "the issuer trusts this key to post in this channel between
//! `valid_from` and `valid_to`". The channel id is part of the signed content,
//! so a link issued for one channel is useless in any other.

use crate::constants::MAX_DISPLAY_NAME_SIZE;
use crate::crypto::{sign_data, verify_data_signature, PrivateKey, PublicKey, Signature};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The signed portion of a link.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkContent {
    /// Channel the delegation applies to.
    pub channel_id: ContentHash,
    /// Key being trusted.
    pub trustee_public_key: PublicKey,
    /// Human-readable name for the trustee.
    pub trustee_display_name: String,
    /// Start of validity (Unix seconds, inclusive).
    pub valid_from: u64,
    /// End of validity (Unix seconds, inclusive).
    pub valid_to: u64,
}

impl fmt::Debug for LinkContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkContent")
            .field("channel_id", &self.channel_id)
            .field("trustee", &self.trustee_display_name)
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish()
    }
}

/// A signed delegation from an issuer to a trustee.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    trustee_public_key: PublicKey,
    trustee_display_name: String,
    valid_from: u64,
    valid_to: u64,
    signature: Signature,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("trustee", &self.trustee_display_name)
            .field("valid_from", &self.valid_from)
            .field("valid_to", &self.valid_to)
            .finish()
    }
}

impl Link {
    /// Signs a new link with the issuer's key.
    pub fn issue(issuer_key: &PrivateKey, content: LinkContent) -> Result<Self> {
        validate_display_name(&content.trustee_display_name)?;
        if content.valid_from > content.valid_to {
            return Err(Error::validation("Link validity window is empty"));
        }

        let signature = sign_data(issuer_key, &content)?;
        Ok(Self {
            trustee_public_key: content.trustee_public_key,
            trustee_display_name: content.trustee_display_name,
            valid_from: content.valid_from,
            valid_to: content.valid_to,
            signature,
        })
    }

    /// Rebuilds the signed content for `channel_id`.
    pub fn content(&self, channel_id: &ContentHash) -> LinkContent {
        LinkContent {
            channel_id: *channel_id,
            trustee_public_key: self.trustee_public_key.clone(),
            trustee_display_name: self.trustee_display_name.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }

    /// Checks the link's structure, its signature by `issuer` for
    /// `channel_id`, and that `timestamp` falls inside the validity window.
    pub fn verify(&self, issuer: &PublicKey, channel_id: &ContentHash, timestamp: u64) -> Result<()> {
        validate_display_name(&self.trustee_display_name)
            .map_err(|e| Error::chain(e.to_string()))?;

        verify_data_signature(issuer, &self.content(channel_id), &self.signature)
            .map_err(|e| Error::chain(format!("Invalid link signature: {}", e)))?;

        if !self.is_valid_at(timestamp) {
            return Err(Error::chain(format!(
                "Link for '{}' is not valid at {} (window {}..={})",
                self.trustee_display_name, timestamp, self.valid_from, self.valid_to
            )));
        }
        Ok(())
    }

    /// Returns true if `timestamp` falls inside the validity window.
    pub fn is_valid_at(&self, timestamp: u64) -> bool {
        self.valid_from <= timestamp && timestamp <= self.valid_to
    }

    /// Returns the trusted key.
    pub fn trustee_public_key(&self) -> &PublicKey {
        &self.trustee_public_key
    }

    /// Returns the trustee's display name.
    pub fn trustee_display_name(&self) -> &str {
        &self.trustee_display_name
    }

    /// Returns the start of validity.
    pub fn valid_from(&self) -> u64 {
        self.valid_from
    }

    /// Returns the end of validity.
    pub fn valid_to(&self) -> u64 {
        self.valid_to
    }
}

/// Display names are mandatory and bounded.
pub fn validate_display_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("Display name cannot be empty"));
    }
    if name.len() > MAX_DISPLAY_NAME_SIZE {
        return Err(Error::validation(format!(
            "Display name exceeds {} bytes",
            MAX_DISPLAY_NAME_SIZE
        )));
    }
    Ok(())
}
