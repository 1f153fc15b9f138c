//! Wire-level behaviour of a session: handshake rules, hostile frames and the
//! invite exchange.
//!
//! Hostile tests drive one side of a socket pair by hand with raw frames.

use dagchat::constants::{MAX_BULK_COUNT, PROTOCOL_VERSION};
use dagchat::protocol::{decode, encode, Hello, Shake};
use dagchat::storage::Cursor;
use dagchat::{
    Channel, ContentHash, Error, Identity, MemoryBackend, MemorySocket, Packet, PeerId, Protocol,
    ProtocolConfig, Socket,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config() -> ProtocolConfig {
    let mut config = ProtocolConfig::default();
    config.handshake_timeout = Duration::from_secs(2);
    config.sync.response_timeout = Duration::from_secs(2);
    config
}

fn node() -> Arc<Protocol> {
    Protocol::new(Arc::new(MemoryBackend::new()), config())
}

/// Starts a session on `protocol` and hands back the raw remote end.
fn attach(protocol: &Arc<Protocol>) -> (MemorySocket, JoinHandle<dagchat::Result<()>>) {
    let (local, remote) = MemorySocket::pair();
    let protocol = Arc::clone(protocol);
    let session = tokio::spawn(async move { protocol.connect(Arc::new(local)).await });
    (remote, session)
}

/// Completes the handshake from the raw side with the largest possible peer
/// id, so the protocol under test always leads.
async fn handshake(remote: &MemorySocket) -> PeerId {
    let hello: Hello = decode(&remote.receive(WAIT).await.unwrap()).unwrap();
    assert_eq!(hello.version, PROTOCOL_VERSION);
    remote
        .send(
            encode(&Hello {
                version: PROTOCOL_VERSION,
                peer_id: PeerId::from_bytes([0xFF; 32]),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let shake: Shake = decode(&remote.receive(WAIT).await.unwrap()).unwrap();
    assert!(!shake.is_duplicate);
    hello.peer_id
}

async fn next_packet(remote: &MemorySocket) -> Packet {
    Packet::from_bytes(&remote.receive(WAIT).await.unwrap()).unwrap()
}

async fn expect_violation(remote: &MemorySocket, session: JoinHandle<dagchat::Result<()>>) {
    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_ban_worthy(), "{err}");

    // A best-effort error packet precedes the close
    match next_packet(remote).await {
        Packet::Error { reason } => assert!(!reason.is_empty()),
        other => panic!("expected error packet, got {:?}", other),
    }
    assert!(matches!(remote.receive(WAIT).await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    let a = node();
    let (remote, session) = attach(&a);

    let _: Hello = decode(&remote.receive(WAIT).await.unwrap()).unwrap();
    remote
        .send(
            encode(&Hello {
                version: PROTOCOL_VERSION + 1,
                peer_id: PeerId::random(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    expect_violation(&remote, session).await;
    assert!(a.connected_peers().is_empty());
}

#[tokio::test]
async fn test_self_connection_rejected() {
    let a = node();
    let (remote, session) = attach(&a);

    let hello: Hello = decode(&remote.receive(WAIT).await.unwrap()).unwrap();
    remote.send(encode(&hello).unwrap()).await.unwrap();

    expect_violation(&remote, session).await;
}

#[tokio::test]
async fn test_handshake_times_out() {
    let a = node();
    let (remote, session) = attach(&a);
    let _: Hello = decode(&remote.receive(WAIT).await.unwrap()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_unknown_packet_tag_ends_session() {
    let a = node();
    let (remote, session) = attach(&a);
    handshake(&remote).await;

    remote.send(vec![0x2A, 0, 0, 0]).await.unwrap();
    expect_violation(&remote, session).await;
    assert!(a.connected_peers().is_empty());
}

#[tokio::test]
async fn test_oversized_bulk_request_ends_session() {
    let a = node();
    let (remote, session) = attach(&a);
    handshake(&remote).await;

    let packet = Packet::Bulk {
        channel_id: ContentHash::from_bytes([1; 32]),
        hashes: vec![ContentHash::from_bytes([2; 32]); MAX_BULK_COUNT + 1],
    };
    remote.send(encode(&packet).unwrap()).await.unwrap();
    expect_violation(&remote, session).await;
}

#[tokio::test]
async fn test_zero_query_limit_ends_session() {
    let a = node();
    let (remote, session) = attach(&a);
    handshake(&remote).await;

    let packet = Packet::Query {
        channel_id: ContentHash::from_bytes([1; 32]),
        cursor: Cursor::Height(0),
        is_backward: false,
        limit: 0,
    };
    remote.send(encode(&packet).unwrap()).await.unwrap();
    expect_violation(&remote, session).await;
}

#[tokio::test]
async fn test_queries_answered_for_held_and_unknown_channels() {
    let owner = Identity::generate("owner").unwrap();
    let a = node();
    let channel = Arc::new(
        Channel::from_identity(&owner, "general", Arc::clone(a.backend()), 64)
            .await
            .unwrap(),
    );
    let posted = channel.post(&json!({ "text": "hi" }), &owner).await.unwrap();
    a.add_channel(Arc::clone(&channel)).unwrap();

    let (remote, _session) = attach(&a);
    handshake(&remote).await;

    // The protocol opens a sync of its own channel first; answer it with
    // nothing so it settles
    match next_packet(&remote).await {
        Packet::Query { channel_id, .. } => {
            assert_eq!(channel_id, *channel.id());
            remote
                .send(
                    Packet::QueryResponse {
                        channel_id,
                        messages: Vec::new(),
                        forward_hash: None,
                        backward_hash: None,
                    }
                    .to_bytes()
                    .unwrap(),
                )
                .await
                .unwrap();
        }
        other => panic!("expected query, got {:?}", other),
    }

    let query = |channel_id| {
        Packet::Query {
            channel_id,
            cursor: Cursor::Height(0),
            is_backward: false,
            limit: 10,
        }
        .to_bytes()
        .unwrap()
    };

    remote.send(query(*channel.id())).await.unwrap();
    match next_packet(&remote).await {
        Packet::QueryResponse { messages, .. } => {
            let hashes: Vec<_> = messages.iter().map(|m| m.hash).collect();
            assert_eq!(hashes, vec![channel.root_hash().unwrap(), posted]);
        }
        other => panic!("expected query response, got {:?}", other),
    }

    let unknown = ContentHash::from_bytes([7; 32]);
    remote.send(query(unknown)).await.unwrap();
    match next_packet(&remote).await {
        Packet::QueryResponse {
            channel_id,
            messages,
            ..
        } => {
            assert_eq!(channel_id, unknown);
            assert!(messages.is_empty());
        }
        other => panic!("expected query response, got {:?}", other),
    }

    // Bulk returns the encrypted messages in request order
    remote
        .send(
            Packet::Bulk {
                channel_id: *channel.id(),
                hashes: vec![posted, channel.root_hash().unwrap()],
            }
            .to_bytes()
            .unwrap(),
        )
        .await
        .unwrap();
    match next_packet(&remote).await {
        Packet::BulkResponse {
            messages,
            forward_index,
            ..
        } => {
            assert_eq!(forward_index, 2);
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].hash().unwrap(), posted);
        }
        other => panic!("expected bulk response, got {:?}", other),
    }

    a.close().await;
}

#[tokio::test]
async fn test_remote_error_ends_session() {
    let a = node();
    let (remote, session) = attach(&a);
    handshake(&remote).await;

    remote
        .send(Packet::error("going away").to_bytes().unwrap())
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(Error::Remote(reason)) => assert_eq!(reason, "going away"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invite_flow() {
    let alice = Identity::generate("alice").unwrap();
    let bob = Identity::generate("bob").unwrap();
    let a = node();
    let b = node();

    let on_a = Arc::new(
        Channel::from_identity(&alice, "general", Arc::clone(a.backend()), 64)
            .await
            .unwrap(),
    );
    on_a.post(&json!({ "text": "before bob" }), &alice)
        .await
        .unwrap();
    a.add_channel(Arc::clone(&on_a)).unwrap();

    let (left, right) = MemorySocket::pair();
    let a2 = Arc::clone(&a);
    let b2 = Arc::clone(&b);
    tokio::spawn(async move { a2.connect(Arc::new(left)).await });
    tokio::spawn(async move { b2.connect(Arc::new(right)).await });
    for _ in 0..250 {
        if !a.connected_peers().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Bob asks for an invite addressed to his node
    let (request, secret) = b.request_invite(&bob).unwrap();
    let request = dagchat::InviteRequest::from_hex(&request.to_hex().unwrap()).unwrap();

    let (joined, sent) = tokio::join!(
        b.accept_invite(&bob, secret, Duration::from_secs(5)),
        a.invite(on_a.id(), &alice, &request, "bob"),
    );
    sent.unwrap();
    let on_b = joined.unwrap();
    assert_eq!(on_b.id(), on_a.id());
    assert_eq!(on_b.name(), "general");
    assert_eq!(bob.chain(on_a.id(), on_a.public_key()).unwrap().len(), 1);

    for _ in 0..250 {
        if on_b.message_count().await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(on_b.message_count().await.unwrap(), 2);

    let hash = on_b.post(&json!({ "text": "thanks" }), &bob).await.unwrap();
    for _ in 0..250 {
        if on_a.has_message(&hash).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let message = on_a.get_message(&hash).await.unwrap().unwrap();
    assert_eq!(message.author_name(), Some("bob"));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_invite_errors() {
    let alice = Identity::generate("alice").unwrap();
    let bob = Identity::generate("bob").unwrap();
    let a = node();
    let b = node();
    let channel = Arc::new(
        Channel::from_identity(&alice, "general", Arc::clone(a.backend()), 64)
            .await
            .unwrap(),
    );
    a.add_channel(Arc::clone(&channel)).unwrap();

    // Not connected to the requester
    let (request, secret) = b.request_invite(&bob).unwrap();
    let err = a
        .invite(channel.id(), &alice, &request, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerNotFound(_)));

    let err = a
        .invite(&ContentHash::from_bytes([3; 32]), &alice, &request, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelNotFound(_)));

    // Nobody sends it, so the wait expires
    let err = b
        .accept_invite(&bob, secret, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // Closing fails pending waits
    let (_, secret) = b.request_invite(&bob).unwrap();
    let waiter = {
        let b = Arc::clone(&b);
        tokio::spawn(async move {
            let bob = Identity::generate("bob").unwrap();
            b.accept_invite(&bob, secret, Duration::from_secs(5)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.close().await;
    assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));
}

#[tokio::test]
async fn test_duplicate_channel_rejected() {
    let alice = Identity::generate("alice").unwrap();
    let a = node();
    let channel = Arc::new(
        Channel::from_identity(&alice, "general", Arc::clone(a.backend()), 64)
            .await
            .unwrap(),
    );
    a.add_channel(Arc::clone(&channel)).unwrap();
    assert!(matches!(
        a.add_channel(Arc::clone(&channel)),
        Err(Error::ChannelExists(_))
    ));

    let other_owner = Identity::generate("other").unwrap();
    let same_name = Channel::from_identity(&other_owner, "general", Arc::clone(a.backend()), 64)
        .await
        .unwrap();
    assert!(matches!(
        a.add_channel(Arc::new(same_name)),
        Err(Error::ChannelExists(_))
    ));
    assert_eq!(a.channels().len(), 1);
    assert!(a.channel_by_name("general").is_some());
}
