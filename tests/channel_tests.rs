//! Channel DAG invariants: heights, the immutable root, idempotent receive,
//! body caps by chain length, pagination and persistence.

use dagchat::channel::validation::max_body_size;
use dagchat::channel::{MessageBody, MessageContent};
use dagchat::constants::MAX_PARENT_DELTA_SECS;
use dagchat::crypto::current_timestamp;
use dagchat::storage::{Cursor, RocksDbConfig};
use dagchat::{
    Channel, ContentHash, Error, Identity, MemoryBackend, Message, Received, RocksDbBackend,
    StorageBackend,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const CACHE: usize = 64;

async fn new_channel(owner: &Identity) -> Channel {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    Channel::from_identity(owner, "general", backend, CACHE)
        .await
        .unwrap()
}

/// Root followed by `count` posts, each on top of the previous one.
async fn linear(owner: &Identity, count: usize) -> (Channel, Vec<ContentHash>) {
    let channel = new_channel(owner).await;
    let mut hashes = vec![channel.root_hash().unwrap()];
    for i in 0..count {
        hashes.push(channel.post(&json!({ "n": i }), owner).await.unwrap());
    }
    (channel, hashes)
}

fn forge(
    channel: &Channel,
    author: &Identity,
    parents: Vec<ContentHash>,
    height: u64,
    body: MessageBody,
) -> dagchat::EncryptedMessage {
    forge_at(channel, author, parents, height, current_timestamp(), body)
}

fn forge_at(
    channel: &Channel,
    author: &Identity,
    parents: Vec<ContentHash>,
    height: u64,
    timestamp: u64,
    body: MessageBody,
) -> dagchat::EncryptedMessage {
    let chain = author.chain_for(channel.id(), channel.public_key()).unwrap();
    let content = MessageContent {
        parents,
        height,
        chain,
        timestamp,
        body,
    };
    let message = Message::sign(channel.id(), content, author).unwrap();
    channel.encrypt(&message).unwrap()
}

fn text(value: &str) -> MessageBody {
    MessageBody::json(&json!({ "text": value })).unwrap()
}

/// Delegates owner -> alice -> bob -> carol and returns carol, who holds a
/// chain of the maximum length.
fn deepest_member(channel: &Channel, owner: &Identity) -> Identity {
    let alice = Identity::generate("alice").unwrap();
    let bob = Identity::generate("bob").unwrap();
    let carol = Identity::generate("carol").unwrap();

    let mut holder = owner;
    for next in [&alice, &bob, &carol] {
        let held = holder.chain_for(channel.id(), channel.public_key()).unwrap();
        let link = holder
            .issue_link(
                channel.id(),
                channel.public_key(),
                next.public_key(),
                next.name(),
                None,
                None,
            )
            .unwrap();
        next.add_chain(channel.id(), channel.public_key(), held.extend(link).unwrap())
            .unwrap();
        holder = next;
    }
    carol
}

/// A channel whose root and ten-message branch are two months old, plus one
/// fresh message on the root. Returns the channel, the stale tip and the
/// fresh message.
async fn stale_history(owner: &Identity) -> (Channel, ContentHash, ContentHash) {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let channel = Channel::from_public_key("general", owner.public_key().clone(), backend, CACHE)
        .await
        .unwrap();

    let now = current_timestamp();
    let old = now - 2 * MAX_PARENT_DELTA_SECS;
    let root = forge_at(&channel, owner, Vec::new(), 0, old, MessageBody::Root);
    let root = channel.receive(&root).await.unwrap().hash();

    let mut stale = root;
    for i in 1..=10u64 {
        let next = forge_at(&channel, owner, vec![stale], i, old + i, text("old"));
        stale = channel.receive(&next).await.unwrap().hash();
    }
    let fresh = forge_at(&channel, owner, vec![root], 1, now, text("fresh"));
    let fresh = channel.receive(&fresh).await.unwrap().hash();
    (channel, stale, fresh)
}

#[tokio::test]
async fn test_heights_follow_parents() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, hashes) = linear(&owner, 3).await;

    for (expected, hash) in hashes.iter().enumerate() {
        let message = channel.get_message(hash).await.unwrap().unwrap();
        assert_eq!(message.height(), expected as u64);
    }
    assert_eq!(channel.leaves().await.unwrap(), vec![hashes[3]]);
}

#[tokio::test]
async fn test_wrong_height_rejected() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, hashes) = linear(&owner, 1).await;

    let body = MessageBody::json(&json!({ "forged": true })).unwrap();
    let forged = forge(&channel, &owner, vec![hashes[1]], 7, body);
    let err = channel.receive(&forged).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert!(err.is_ban_worthy());
    assert_eq!(channel.message_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_second_root_is_rejected() {
    let owner = Identity::generate("owner").unwrap();
    let channel = new_channel(&owner).await;
    let root = channel.root_hash().unwrap();

    // A distinct root signed by the same key: fresh nonce, so a new hash
    let other = forge(&channel, &owner, Vec::new(), 0, MessageBody::Root);
    match channel.receive(&other).await {
        Err(Error::RootMismatch { expected, actual }) => {
            assert_eq!(expected, root);
            assert_ne!(actual, root);
        }
        other => panic!("expected root mismatch, got {:?}", other),
    }
    assert_eq!(channel.root_hash(), Some(root));
    assert_eq!(channel.message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_receive_is_idempotent() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, hashes) = linear(&owner, 2).await;

    let body = MessageBody::json(&json!({ "text": "again" })).unwrap();
    let encrypted = forge(&channel, &owner, vec![hashes[2]], 3, body);
    let first = channel.receive(&encrypted).await.unwrap();
    let second = channel.receive(&encrypted).await.unwrap();

    assert!(matches!(first, Received::New(_)));
    assert_eq!(second, Received::Duplicate(first.hash()));
    assert_eq!(channel.message_count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_unknown_parent_is_recoverable() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, _) = linear(&owner, 1).await;

    let missing = ContentHash::from_bytes([0xAB; 32]);
    let body = MessageBody::json(&json!({})).unwrap();
    let orphan = forge(&channel, &owner, vec![missing], 1, body);
    let err = channel.receive(&orphan).await.unwrap_err();
    assert!(matches!(err, Error::ParentNotFound(h) if h == missing));
    assert!(err.is_recoverable());
    assert!(!err.is_ban_worthy());
}

#[tokio::test]
async fn test_body_cap_shrinks_with_chain_length() {
    let owner = Identity::generate("owner").unwrap();
    let channel = new_channel(&owner).await;
    let carol = deepest_member(&channel, &owner);

    // 256KB for the root, 4KB at the maximum chain length
    let big = json!({ "text": "x".repeat(8 * 1024) });
    let small = json!({ "text": "x".repeat(1024) });

    let err = channel.post(&big, &carol).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    channel.post(&small, &carol).await.unwrap();
    channel.post(&big, &owner).await.unwrap();

    let ordered = channel.messages_ordered().await.unwrap();
    assert_eq!(ordered.len(), 3);
    assert_eq!(ordered[1].1.author_name(), Some("carol"));
}

#[tokio::test]
async fn test_received_body_over_chain_cap_rejected() {
    let owner = Identity::generate("owner").unwrap();
    let channel = new_channel(&owner).await;
    let root = channel.root_hash().unwrap();
    let carol = deepest_member(&channel, &owner);

    let oversized = text(&"x".repeat(max_body_size(3) + 1));
    let forged = forge(&channel, &carol, vec![root], 1, oversized);
    let err = channel.receive(&forged).await.unwrap_err();
    assert!(matches!(err, Error::Validation(ref m) if m.contains("Body too large")), "{err}");
    assert!(err.is_ban_worthy());
    assert_eq!(channel.message_count().await.unwrap(), 1);

    // Under the cap the same author is admitted
    let fits = forge(&channel, &carol, vec![root], 1, text(&"x".repeat(1024)));
    assert!(matches!(channel.receive(&fits).await.unwrap(), Received::New(_)));
}

#[tokio::test]
async fn test_stale_parent_excluded_from_height_on_receive() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, stale, fresh) = stale_history(&owner).await;
    let mut parents = vec![stale, fresh];
    parents.sort();
    let fresh_time = channel.get_message(&fresh).await.unwrap().unwrap().timestamp();

    // Counting the ten-high stale tip would give height 11
    let counted = forge_at(&channel, &owner, parents.clone(), 11, fresh_time, text("m"));
    assert!(matches!(channel.receive(&counted).await, Err(Error::Validation(_))));

    // Only the fresh parent bounds the timestamp from below
    let early = forge_at(&channel, &owner, parents.clone(), 2, fresh_time - 1, text("m"));
    assert!(matches!(channel.receive(&early).await, Err(Error::Validation(_))));

    let merge = forge_at(&channel, &owner, parents.clone(), 2, fresh_time, text("m"));
    let merge = channel.receive(&merge).await.unwrap().hash();
    let message = channel.get_message(&merge).await.unwrap().unwrap();
    assert_eq!(message.height(), 2);
    assert_eq!(message.parents(), parents.as_slice());
    assert_eq!(channel.leaves().await.unwrap(), vec![merge]);
}

#[tokio::test]
async fn test_post_skips_stale_leaves() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, stale, fresh) = stale_history(&owner).await;
    let mut leaves = vec![stale, fresh];
    leaves.sort();
    assert_eq!(channel.leaves().await.unwrap(), leaves);

    let posted = channel.post(&json!({ "text": "now" }), &owner).await.unwrap();
    let message = channel.get_message(&posted).await.unwrap().unwrap();
    assert_eq!(message.parents(), &[fresh]);
    assert_eq!(message.height(), 2);

    // The stale tip stays a leaf
    let mut expected = vec![stale, posted];
    expected.sort();
    assert_eq!(channel.leaves().await.unwrap(), expected);
}

#[tokio::test]
async fn test_stranger_cannot_post() {
    let owner = Identity::generate("owner").unwrap();
    let stranger = Identity::generate("stranger").unwrap();
    let channel = new_channel(&owner).await;

    let err = channel
        .post(&json!({ "text": "hi" }), &stranger)
        .await
        .unwrap_err();
    assert!(err.is_capability());
}

#[tokio::test]
async fn test_forward_and_backward_pages() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, hashes) = linear(&owner, 10).await;
    let page_hashes = |page: &dagchat::storage::QueryPage| -> Vec<ContentHash> {
        page.messages.iter().map(|m| m.hash).collect()
    };

    let first = channel.query(&Cursor::Height(0), false, 4).await.unwrap();
    assert_eq!(page_hashes(&first), hashes[0..4]);
    assert_eq!(first.forward_hash, Some(hashes[4]));
    assert_eq!(first.backward_hash, None);

    let middle = channel
        .query(&Cursor::Hash(hashes[4]), false, 4)
        .await
        .unwrap();
    assert_eq!(page_hashes(&middle), hashes[4..8]);
    assert_eq!(middle.forward_hash, Some(hashes[8]));
    assert_eq!(middle.backward_hash, Some(hashes[4]));

    let last = channel
        .query(&Cursor::Hash(hashes[8]), false, 4)
        .await
        .unwrap();
    assert_eq!(page_hashes(&last), hashes[8..11]);
    assert_eq!(last.forward_hash, None);

    let back = channel
        .query(&Cursor::Hash(hashes[8]), true, 4)
        .await
        .unwrap();
    assert_eq!(page_hashes(&back), hashes[4..8]);
    assert_eq!(back.backward_hash, Some(hashes[4]));
    assert_eq!(back.forward_hash, Some(hashes[8]));

    let start = channel
        .query(&Cursor::Hash(hashes[4]), true, 4)
        .await
        .unwrap();
    assert_eq!(page_hashes(&start), hashes[0..4]);
    assert_eq!(start.backward_hash, None);

    let unknown = channel
        .query(&Cursor::Hash(ContentHash::from_bytes([9; 32])), false, 4)
        .await
        .unwrap();
    assert!(unknown.messages.is_empty());
}

#[tokio::test]
async fn test_concurrent_branches_merge() {
    let owner = Identity::generate("owner").unwrap();
    let (channel, hashes) = linear(&owner, 1).await;

    // Two messages on the same parent leave two leaves
    let a = forge(
        &channel,
        &owner,
        vec![hashes[1]],
        2,
        MessageBody::json(&json!({ "branch": "a" })).unwrap(),
    );
    let b = forge(
        &channel,
        &owner,
        vec![hashes[1]],
        2,
        MessageBody::json(&json!({ "branch": "b" })).unwrap(),
    );
    let a = channel.receive(&a).await.unwrap().hash();
    let b = channel.receive(&b).await.unwrap().hash();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(channel.leaves().await.unwrap(), expected);

    // The next post references both
    let merge = channel.post(&json!({ "merge": true }), &owner).await.unwrap();
    let message = channel.get_message(&merge).await.unwrap().unwrap();
    assert_eq!(message.parents(), expected.as_slice());
    assert_eq!(message.height(), 3);
    assert_eq!(channel.leaves().await.unwrap(), vec![merge]);
}

#[tokio::test]
async fn test_rocksdb_channel_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let owner = Identity::generate("owner").unwrap();
    let config = RocksDbConfig::default();

    let (id, leaves) = {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(RocksDbBackend::open(dir.path(), &config).unwrap());
        let channel = Channel::from_identity(&owner, "general", backend, CACHE)
            .await
            .unwrap();
        for i in 0..5 {
            channel.post(&json!({ "n": i }), &owner).await.unwrap();
        }
        (*channel.id(), channel.leaves().await.unwrap())
    };

    let backend: Arc<dyn StorageBackend> =
        Arc::new(RocksDbBackend::open(dir.path(), &config).unwrap());
    let channels = Channel::load_all(backend, CACHE).await.unwrap();
    assert_eq!(channels.len(), 1);
    let channel = &channels[0];
    assert_eq!(*channel.id(), id);
    assert_eq!(channel.name(), "general");
    assert!(channel.root_hash().is_some());
    assert_eq!(channel.message_count().await.unwrap(), 6);
    assert_eq!(channel.leaves().await.unwrap(), leaves);

    channel.post(&json!({ "n": 5 }), &owner).await.unwrap();
    assert_eq!(channel.message_count().await.unwrap(), 7);
}

#[tokio::test]
async fn test_replicas_converge_regardless_of_order() {
    let owner = Identity::generate("owner").unwrap();
    let (source, _) = linear(&owner, 6).await;
    let all = source.messages_ordered().await.unwrap();
    let encrypted: Vec<_> = all.iter().map(|(_, m)| source.encrypt(m).unwrap()).collect();

    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let replica = Channel::from_public_key("general", owner.public_key().clone(), backend, CACHE)
        .await
        .unwrap();

    // Newest first: each fails until its parent arrives, so retry until done
    let mut pending: Vec<_> = encrypted.iter().rev().collect();
    while !pending.is_empty() {
        let mut next = Vec::new();
        for message in pending {
            match replica.receive(message).await {
                Ok(_) => {}
                Err(Error::ParentNotFound(_)) => next.push(message),
                Err(e) => panic!("unexpected {e}"),
            }
        }
        pending = next;
    }

    assert_eq!(replica.root_hash(), source.root_hash());
    assert_eq!(replica.leaves().await.unwrap(), source.leaves().await.unwrap());
    let replica_order: Vec<_> = replica
        .messages_ordered()
        .await
        .unwrap()
        .into_iter()
        .map(|(h, _)| h)
        .collect();
    let source_order: Vec<_> = all.into_iter().map(|(h, _)| h).collect();
    assert_eq!(replica_order, source_order);
}
