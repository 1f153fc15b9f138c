//! Delegation chains.
//!
//! A chain is the path of trust from a channel's root key to a posting key:
//! the root signs link 0, the trustee of link 0 signs link 1, and so on. An
//! empty chain belongs to the root key itself.

use crate::constants::MAX_CHAIN_LENGTH;
use crate::crypto::{hash_data, PublicKey};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use crate::identity::link::Link;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ordered sequence of links, at most [`MAX_CHAIN_LENGTH`] long.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    links: Vec<Link>,
}

impl Chain {
    /// The chain held by the channel root.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a chain, rejecting length overflow.
    pub fn new(links: Vec<Link>) -> Result<Self> {
        if links.len() > MAX_CHAIN_LENGTH {
            return Err(Error::chain(format!(
                "Chain length {} exceeds maximum {}",
                links.len(),
                MAX_CHAIN_LENGTH
            )));
        }
        Ok(Self { links })
    }

    /// Returns a new chain with `link` appended.
    pub fn extend(&self, link: Link) -> Result<Self> {
        let mut links = self.links.clone();
        links.push(link);
        Self::new(links)
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True for the root's own chain.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Returns true if another link can be appended.
    pub fn can_extend(&self) -> bool {
        self.links.len() < MAX_CHAIN_LENGTH
    }

    /// The links in delegation order.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Display name of the terminal trustee, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.links.last().map(|l| l.trustee_display_name())
    }

    /// Earliest `valid_to` across the links. `None` for the empty chain,
    /// which never expires.
    pub fn expires_at(&self) -> Option<u64> {
        self.links.iter().map(|l| l.valid_to()).min()
    }

    /// Walks the chain from `root_key` and returns the terminal trustee key.
    ///
    /// Every link must be signed by the previous key for `channel_id` and be
    /// valid at `timestamp`.
    pub fn verify(
        &self,
        root_key: &PublicKey,
        channel_id: &ContentHash,
        timestamp: u64,
    ) -> Result<PublicKey> {
        if self.links.len() > MAX_CHAIN_LENGTH {
            return Err(Error::chain(format!(
                "Chain length {} exceeds maximum {}",
                self.links.len(),
                MAX_CHAIN_LENGTH
            )));
        }

        let mut current = root_key;
        for (index, link) in self.links.iter().enumerate() {
            link.verify(current, channel_id, timestamp)
                .map_err(|e| Error::chain(format!("Link {}: {}", index, e)))?;
            current = link.trustee_public_key();
        }
        Ok(current.clone())
    }

    /// Total order used to decide whether a newly received chain replaces
    /// the one already held. `Ordering::Less` means `self` is better.
    ///
    /// Shorter chains win, then chains that expire later, then the smaller
    /// SHA3-256 of the serialized chain.
    pub fn compare(&self, other: &Chain) -> Ordering {
        self.len()
            .cmp(&other.len())
            .then_with(|| {
                let mine = self.expires_at().unwrap_or(u64::MAX);
                let theirs = other.expires_at().unwrap_or(u64::MAX);
                theirs.cmp(&mine)
            })
            .then_with(|| self.digest().cmp(&other.digest()))
    }

    /// Returns true if `self` strictly beats `other`.
    pub fn is_better_than(&self, other: &Chain) -> bool {
        self.compare(other) == Ordering::Less
    }

    fn digest(&self) -> [u8; 32] {
        hash_data(&bincode::serialize(self).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::identity::link::LinkContent;

    fn channel() -> ContentHash {
        ContentHash::from_bytes([5u8; 32])
    }

    fn link(issuer: &KeyPair, trustee: &KeyPair, name: &str, valid_to: u64) -> Link {
        Link::issue(
            issuer.private_key(),
            LinkContent {
                channel_id: channel(),
                trustee_public_key: trustee.public_key().clone(),
                trustee_display_name: name.to_string(),
                valid_from: 100,
                valid_to,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_empty_chain_resolves_to_root() {
        let root = KeyPair::generate();
        let key = Chain::empty().verify(root.public_key(), &channel(), 0).unwrap();
        assert_eq!(&key, root.public_key());
    }

    #[test]
    fn test_chain_resolves_to_terminal_trustee() {
        let root = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let chain = Chain::new(vec![link(&root, &a, "a", 1_000), link(&a, &b, "b", 1_000)]).unwrap();
        let key = chain.verify(root.public_key(), &channel(), 500).unwrap();
        assert_eq!(&key, b.public_key());
        assert_eq!(chain.display_name(), Some("b"));
    }

    #[test]
    fn test_chain_rejects_wrong_signer_order() {
        let root = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        // link 1 signed by root instead of a
        let chain = Chain::new(vec![link(&root, &a, "a", 1_000), link(&root, &b, "b", 1_000)]).unwrap();
        assert!(matches!(
            chain.verify(root.public_key(), &channel(), 500),
            Err(Error::Chain(_))
        ));
    }

    #[test]
    fn test_chain_length_bound() {
        let keys: Vec<KeyPair> = (0..5).map(|_| KeyPair::generate()).collect();
        let links: Vec<Link> = keys
            .windows(2)
            .map(|w| link(&w[0], &w[1], "x", 1_000))
            .collect();
        assert_eq!(links.len(), 4);
        assert!(Chain::new(links).is_err());
    }

    #[test]
    fn test_compare_prefers_shorter_then_longer_lived() {
        let root = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let short = Chain::new(vec![link(&root, &a, "a", 1_000)]).unwrap();
        let long = Chain::new(vec![link(&root, &b, "b", 5_000), link(&b, &a, "a", 5_000)]).unwrap();
        assert!(short.is_better_than(&long));
        assert!(!long.is_better_than(&short));

        let later = Chain::new(vec![link(&root, &a, "a", 9_000)]).unwrap();
        assert!(later.is_better_than(&short));

        assert!(Chain::empty().is_better_than(&short));
        assert!(!short.is_better_than(&short));
    }
}
