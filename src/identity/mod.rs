//! Identities and trust delegation.
//!
//! An [`Identity`] owns an ML-DSA-87 key pair and the delegation [`Chain`]s
//! that let it post in channels rooted at other keys. Chains are built from
//! [`Link`]s; each link binds a trustee key to one channel for a window of
//! time.
//!
//! Chains only ever improve: a newly offered chain replaces the held one only
//! if it is strictly better under [`Chain::compare`].

pub mod chain;
pub mod link;

pub use chain::Chain;
pub use link::{validate_display_name, Link, LinkContent};

use crate::constants::{CHAIN_LEEWAY_SECS, DEFAULT_LINK_LIFETIME_SECS};
use crate::crypto::{bytes_equal, current_timestamp, sign_data, KeyPair, PublicKey, Signature};
use crate::dag::ContentHash;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Persisted form of an identity.
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    name: String,
    keypair: KeyPair,
    chains: Vec<(ContentHash, Chain)>,
}

/// A local identity: a signing key pair plus the chains it holds.
pub struct Identity {
    name: String,
    keypair: KeyPair,
    chains: RwLock<HashMap<ContentHash, Chain>>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("public_key", self.keypair.public_key())
            .field("chains", &self.chains.read().len())
            .finish()
    }
}

impl Identity {
    /// Creates a new identity with a fresh key pair.
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_display_name(&name)?;
        let keypair = KeyPair::generate();
        info!(name = %name, "Generated identity");
        Ok(Self {
            name,
            keypair,
            chains: RwLock::new(HashMap::new()),
        })
    }

    /// Restores an identity from [`Identity::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord = bincode::deserialize(bytes)
            .map_err(|e| Error::serialization(format!("Failed to decode identity: {}", e)))?;
        validate_display_name(&record.name)?;
        record.keypair.validate()?;
        Ok(Self {
            name: record.name,
            keypair: record.keypair,
            chains: RwLock::new(record.chains.into_iter().collect()),
        })
    }

    /// Serializes the identity, including its secret key.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = IdentityRecord {
            name: self.name.clone(),
            keypair: self.keypair.clone(),
            chains: self
                .chains
                .read()
                .iter()
                .map(|(id, chain)| (*id, chain.clone()))
                .collect(),
        };
        bincode::serialize(&record)
            .map_err(|e| Error::serialization(format!("Failed to encode identity: {}", e)))
    }

    /// The identity's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identity's signing key.
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Signs structured data with the identity's key.
    pub fn sign<T: Serialize>(&self, data: &T) -> Result<Signature> {
        sign_data(self.keypair.private_key(), data)
    }

    fn is_root_of(&self, root_key: &PublicKey) -> bool {
        bytes_equal(self.public_key().as_bytes(), root_key.as_bytes())
    }

    /// Returns the chain held for `channel_id`, if any. The root key always
    /// holds the empty chain.
    pub fn chain(&self, channel_id: &ContentHash, root_key: &PublicKey) -> Option<Chain> {
        if self.is_root_of(root_key) {
            return Some(Chain::empty());
        }
        self.chains.read().get(channel_id).cloned()
    }

    /// Returns the chain to post with, provided it stays valid for the next
    /// few minutes.
    pub fn chain_for(&self, channel_id: &ContentHash, root_key: &PublicKey) -> Result<Chain> {
        let chain = self
            .chain(channel_id, root_key)
            .ok_or_else(|| Error::capability("No delegation chain for this channel"))?;

        let horizon = current_timestamp() + CHAIN_LEEWAY_SECS;
        let trustee = chain
            .verify(root_key, channel_id, horizon)
            .map_err(|e| Error::capability(format!("Delegation chain is not usable: {}", e)))?;
        if !bytes_equal(trustee.as_bytes(), self.public_key().as_bytes()) {
            return Err(Error::capability("Delegation chain does not end at this identity"));
        }
        Ok(chain)
    }

    /// Issues a link delegating posting rights in `channel_id` to `trustee`.
    ///
    /// Fails with a capability error unless this identity holds a usable
    /// chain with spare length.
    pub fn issue_link(
        &self,
        channel_id: &ContentHash,
        root_key: &PublicKey,
        trustee: &PublicKey,
        display_name: &str,
        valid_from: Option<u64>,
        valid_to: Option<u64>,
    ) -> Result<Link> {
        let chain = self.chain_for(channel_id, root_key)?;
        if !chain.can_extend() {
            return Err(Error::capability(format!(
                "Chain of length {} cannot delegate further",
                chain.len()
            )));
        }

        let now = current_timestamp();
        let valid_from = valid_from.unwrap_or_else(|| now.saturating_sub(CHAIN_LEEWAY_SECS));
        let valid_to = valid_to.unwrap_or(now + DEFAULT_LINK_LIFETIME_SECS);

        let link = Link::issue(
            self.keypair.private_key(),
            LinkContent {
                channel_id: *channel_id,
                trustee_public_key: trustee.clone(),
                trustee_display_name: display_name.to_string(),
                valid_from,
                valid_to,
            },
        )?;

        debug!(
            channel = %channel_id,
            trustee = display_name,
            depth = chain.len() + 1,
            "Issued link"
        );
        Ok(link)
    }

    /// Verifies and stores a chain for `channel_id`.
    ///
    /// Returns `Ok(true)` if the chain was stored and `Ok(false)` if the chain
    /// already held is at least as good.
    pub fn add_chain(
        &self,
        channel_id: &ContentHash,
        root_key: &PublicKey,
        chain: Chain,
    ) -> Result<bool> {
        let trustee = chain.verify(root_key, channel_id, current_timestamp())?;
        if !bytes_equal(trustee.as_bytes(), self.public_key().as_bytes()) {
            return Err(Error::chain("Chain does not delegate to this identity"));
        }

        let mut chains = self.chains.write();
        if let Some(existing) = chains.get(channel_id) {
            if !chain.is_better_than(existing) {
                debug!(channel = %channel_id, "Keeping held chain");
                return Ok(false);
            }
        }
        debug!(channel = %channel_id, length = chain.len(), "Stored chain");
        chains.insert(*channel_id, chain);
        Ok(true)
    }

    /// Drops the chain held for `channel_id`.
    pub fn remove_chain(&self, channel_id: &ContentHash) -> Option<Chain> {
        self.chains.write().remove(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_of(owner: &Identity) -> ContentHash {
        ContentHash::from_bytes(owner.public_key().fingerprint())
    }

    #[test]
    fn test_root_holds_empty_chain() {
        let owner = Identity::generate("owner").unwrap();
        let id = channel_of(&owner);
        let chain = owner.chain_for(&id, owner.public_key()).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_issue_and_add_chain() {
        let owner = Identity::generate("owner").unwrap();
        let member = Identity::generate("member").unwrap();
        let id = channel_of(&owner);

        let link = owner
            .issue_link(&id, owner.public_key(), member.public_key(), "member", None, None)
            .unwrap();
        let chain = Chain::new(vec![link]).unwrap();

        assert!(member.add_chain(&id, owner.public_key(), chain.clone()).unwrap());
        assert_eq!(member.chain_for(&id, owner.public_key()).unwrap(), chain);

        // Same chain again is not an improvement
        assert!(!member.add_chain(&id, owner.public_key(), chain).unwrap());
    }

    #[test]
    fn test_issue_link_without_chain_is_capability_error() {
        let owner = Identity::generate("owner").unwrap();
        let stranger = Identity::generate("stranger").unwrap();
        let id = channel_of(&owner);

        let err = stranger
            .issue_link(&id, owner.public_key(), owner.public_key(), "x", None, None)
            .unwrap_err();
        assert!(err.is_capability());
    }

    #[test]
    fn test_add_chain_for_someone_else_rejected() {
        let owner = Identity::generate("owner").unwrap();
        let member = Identity::generate("member").unwrap();
        let other = Identity::generate("other").unwrap();
        let id = channel_of(&owner);

        let link = owner
            .issue_link(&id, owner.public_key(), member.public_key(), "member", None, None)
            .unwrap();
        let chain = Chain::new(vec![link]).unwrap();
        assert!(matches!(
            other.add_chain(&id, owner.public_key(), chain),
            Err(Error::Chain(_))
        ));
    }

    #[test]
    fn test_max_length_chain_cannot_delegate() {
        let owner = Identity::generate("owner").unwrap();
        let ids: Vec<Identity> = (0..3)
            .map(|i| Identity::generate(format!("m{}", i)).unwrap())
            .collect();
        let id = channel_of(&owner);

        let mut issuer = &owner;
        let mut chain = Chain::empty();
        for member in &ids {
            let link = issuer
                .issue_link(&id, owner.public_key(), member.public_key(), member.name(), None, None)
                .unwrap();
            chain = chain.extend(link).unwrap();
            assert!(member.add_chain(&id, owner.public_key(), chain.clone()).unwrap());
            issuer = member;
        }

        let last = &ids[2];
        let err = last
            .issue_link(&id, owner.public_key(), owner.public_key(), "loop", None, None)
            .unwrap_err();
        assert!(err.is_capability());
    }

    #[test]
    fn test_expiring_chain_not_postable() {
        let owner = Identity::generate("owner").unwrap();
        let member = Identity::generate("member").unwrap();
        let id = channel_of(&owner);
        let now = current_timestamp();

        // Valid now, but expires inside the leeway window
        let link = owner
            .issue_link(
                &id,
                owner.public_key(),
                member.public_key(),
                "member",
                Some(now - 10),
                Some(now + 60),
            )
            .unwrap();
        member
            .add_chain(&id, owner.public_key(), Chain::new(vec![link]).unwrap())
            .unwrap();

        assert!(member.chain_for(&id, owner.public_key()).unwrap_err().is_capability());
    }

    #[test]
    fn test_identity_bytes_roundtrip() {
        let owner = Identity::generate("owner").unwrap();
        let member = Identity::generate("member").unwrap();
        let id = channel_of(&owner);
        let link = owner
            .issue_link(&id, owner.public_key(), member.public_key(), "member", None, None)
            .unwrap();
        member
            .add_chain(&id, owner.public_key(), Chain::new(vec![link]).unwrap())
            .unwrap();

        let restored = Identity::from_bytes(&member.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.name(), "member");
        assert_eq!(restored.public_key(), member.public_key());
        assert!(restored.chain_for(&id, owner.public_key()).is_ok());
    }
}
