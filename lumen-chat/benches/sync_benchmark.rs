use std::hint::black_box;

use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use lumen_chat::cache::{MemoryCache, MessageCache, RocksCache, CacheConfig};
use lumen_chat::protocol::LiveFrame;
use lumen_chat::merge_snapshot;
use lumen_core::{Message, RoomId, UserSummary};

fn make_messages(room: &str, count: usize) -> Vec<Message> {
    let sender = UserSummary::new("u1", "Ada");
    (0..count)
        .map(|i| {
            // interleave timestamps so sorting has work to do
            let secs = ((i * 7919) % count) as i64;
            Message::new(
                format!("m{i}"),
                room,
                sender.clone(),
                Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            )
            .with_content("the quick brown fox jumps over the lazy dog")
        })
        .collect()
}

fn bench_merge_snapshot(c: &mut Criterion) {
    let mut messages = make_messages("r1", 1_000);
    // 10% duplicates
    messages.extend(messages[..100].to_vec());

    c.bench_function("merge_snapshot_1k", |b| {
        b.iter(|| black_box(merge_snapshot(black_box(messages.clone()))))
    });
}

fn bench_memory_upsert(c: &mut Criterion) {
    let page = make_messages("r1", 50);

    c.bench_function("memory_upsert_page_50", |b| {
        let cache = MemoryCache::new();
        b.iter(|| cache.upsert(black_box(&page)).unwrap())
    });
}

fn bench_memory_upsert_observed(c: &mut Criterion) {
    let page = make_messages("r1", 50);
    let cache = MemoryCache::new();
    cache.upsert(&make_messages("r1", 1_000)).unwrap();
    let mut observation = cache.observe(&RoomId::from("r1")).unwrap();

    c.bench_function("memory_upsert_observed_1k", |b| {
        b.iter(|| {
            cache.upsert(black_box(&page)).unwrap();
            black_box(observation.latest());
        })
    });
}

fn bench_rocks_upsert(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    let page = make_messages("r1", 50);

    c.bench_function("rocks_upsert_page_50", |b| {
        b.iter(|| cache.upsert(black_box(&page)).unwrap())
    });
}

fn bench_rocks_query(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    cache.upsert(&make_messages("r1", 1_000)).unwrap();
    let room = RoomId::from("r1");

    c.bench_function("rocks_query_1k", |b| {
        b.iter(|| black_box(cache.query(black_box(&room)).unwrap()))
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = LiveFrame::Message(make_messages("r1", 1).remove(0));

    c.bench_function("frame_encode_message", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = LiveFrame::Message(make_messages("r1", 1).remove(0))
        .encode()
        .unwrap();

    c.bench_function("frame_decode_message", |b| {
        b.iter(|| black_box(LiveFrame::decode(black_box(encoded.as_bytes())).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_merge_snapshot,
    bench_memory_upsert,
    bench_memory_upsert_observed,
    bench_rocks_upsert,
    bench_rocks_query,
    bench_frame_encode,
    bench_frame_decode,
);
criterion_main!(benches);
