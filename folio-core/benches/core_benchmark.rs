use criterion::{black_box, criterion_group, criterion_main, Criterion};
use folio_core::codec::{self, DocumentSnapshot};
use folio_core::reducer::{reduce, ChangeEvent};
use folio_core::{Block, BlockPatch, Payload, ReplicaId, Stamp};
use serde_json::json;

fn document(blocks: i64) -> Vec<Block> {
    (0..blocks)
        .map(|i| {
            Block::create(
                &BlockPatch::new(format!("block-{i:05}"))
                    .index(i)
                    .data(Payload::from(json!({ "text": "Lorem ipsum dolor sit amet, consectetur." }))),
                Stamp::new(1, ReplicaId::from("bench")),
            )
        })
        .collect()
}

fn bench_reduce_typing_burst(c: &mut Criterion) {
    // One block edited 1K times, as a fast typist produces between ticks.
    let events: Vec<ChangeEvent> = (0..1000)
        .map(|i| ChangeEvent::changed("block-1", Payload::from(json!(i))))
        .collect();

    c.bench_function("reduce_1K_changes_one_block", |b| {
        b.iter(|| black_box(reduce(black_box(events.clone()))))
    });
}

fn bench_reduce_mixed(c: &mut Criterion) {
    let events: Vec<ChangeEvent> = (0..1000)
        .map(|i| {
            let id = format!("block-{}", i % 50);
            match i % 4 {
                0 => ChangeEvent::added(id, Payload::null()),
                1 => ChangeEvent::changed(id, Payload::from(json!(i))),
                2 => ChangeEvent::moved(id, i),
                _ => ChangeEvent::removed(id),
            }
        })
        .collect();

    c.bench_function("reduce_1K_mixed_50_blocks", |b| {
        b.iter(|| black_box(reduce(black_box(events.clone()))))
    });
}

fn bench_merge(c: &mut Criterion) {
    let base = document(1).remove(0);
    let left = base.patched(
        &BlockPatch::new(base.id.clone()).data(Payload::from(json!("left"))),
        Stamp::new(2, ReplicaId::from("a")),
    );
    let right = base.patched(
        &BlockPatch::new(base.id.clone()).index(4),
        Stamp::new(3, ReplicaId::from("b")),
    );

    c.bench_function("block_merge", |b| {
        b.iter(|| black_box(black_box(&left).merge(black_box(&right))))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let snapshot = DocumentSnapshot::from_blocks(document(500));

    c.bench_function("snapshot_encode_500_blocks", |b| {
        b.iter(|| black_box(codec::encode(black_box(&snapshot)).unwrap()))
    });
}

fn bench_snapshot_decode(c: &mut Criterion) {
    let encoded = codec::encode(&DocumentSnapshot::from_blocks(document(500))).unwrap();

    c.bench_function("snapshot_decode_500_blocks", |b| {
        b.iter(|| black_box(codec::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_reduce_typing_burst,
    bench_reduce_mixed,
    bench_merge,
    bench_snapshot_encode,
    bench_snapshot_decode,
);
criterion_main!(benches);
