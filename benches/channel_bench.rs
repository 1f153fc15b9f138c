//! Benchmarks for the per-message hot path: signing, encryption and
//! admission into a channel.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dagchat::channel::{MessageBody, MessageContent};
use dagchat::crypto::{current_timestamp, ChannelCipher};
use dagchat::{Chain, Channel, ContentHash, Identity, MemoryBackend, Message, StorageBackend};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn content(size: usize) -> MessageContent {
    MessageContent {
        parents: vec![ContentHash::from_bytes([1; 32])],
        height: 1,
        chain: Chain::empty(),
        timestamp: current_timestamp(),
        body: MessageBody::json(&json!({ "text": "x".repeat(size) })).unwrap(),
    }
}

fn bench_signatures(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_signatures");
    let author = Identity::generate("bench").unwrap();
    let channel_id = ContentHash::from_bytes(author.public_key().fingerprint());

    group.bench_function("sign_1kb", |b| {
        b.iter(|| Message::sign(black_box(&channel_id), content(1024), black_box(&author)))
    });

    let message = Message::sign(&channel_id, content(1024), &author).unwrap();
    group.bench_function("verify_1kb", |b| {
        b.iter(|| message.verify_signature(black_box(&channel_id), black_box(author.public_key())))
    });

    group.finish();
}

fn bench_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encryption");
    let author = Identity::generate("bench").unwrap();
    let channel_id = ContentHash::from_bytes(author.public_key().fingerprint());
    let cipher = ChannelCipher::derive(author.public_key()).unwrap();

    for size in [64usize, 4 * 1024, 64 * 1024] {
        let message = Message::sign(&channel_id, content(size), &author).unwrap();
        let encrypted = message.encrypt(&channel_id, &cipher).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &message, |b, message| {
            b.iter(|| message.encrypt(black_box(&channel_id), black_box(&cipher)))
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &encrypted, |b, encrypted| {
            b.iter(|| encrypted.decrypt(black_box(&cipher)))
        });
    }

    group.finish();
}

fn bench_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_receive");
    let rt = Runtime::new().unwrap();
    let owner = Identity::generate("bench").unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let channel = rt
        .block_on(Channel::from_identity(&owner, "bench", backend, 4096))
        .unwrap();

    // Sign, encrypt, validate and store on top of the current leaf
    group.bench_function("post", |b| {
        b.iter(|| rt.block_on(channel.post(black_box(&json!({ "text": "hello" })), &owner)))
    });

    let root = channel.root_hash().unwrap();
    let root_message = rt.block_on(channel.get_message(&root)).unwrap().unwrap();
    let encrypted = channel.encrypt(&root_message).unwrap();
    group.bench_function("receive_duplicate", |b| {
        b.iter(|| rt.block_on(channel.receive(black_box(&encrypted))))
    });

    group.finish();
}

criterion_group!(benches, bench_signatures, bench_encryption, bench_receive);
criterion_main!(benches);
