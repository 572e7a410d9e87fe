//! Property-based tests for block merging and snapshot encoding.

use folio_core::codec::{self, DocumentSnapshot};
use folio_core::{Block, BlockPatch, Payload, ReplicaId, Stamp};
use proptest::prelude::*;

// =============================================================================
// Generators
// =============================================================================

fn arbitrary_stamp() -> impl Strategy<Value = Stamp> {
    (0u64..8, prop::sample::select(vec!["r1", "r2", "r3"]))
        .prop_map(|(clock, replica)| Stamp::new(clock, ReplicaId::from(replica)))
}

/// A self-consistent state of block `id`: authorship fields agree with the
/// stamps, as they do for any block produced by the store.
fn arbitrary_block(id: &'static str) -> impl Strategy<Value = Block> {
    (
        prop::sample::select(vec!["paragraph", "heading", "code"]),
        "[a-c]{0,3}",
        -3i64..3,
        any::<bool>(),
        prop::collection::vec(arbitrary_stamp(), 5),
    )
        .prop_map(move |(kind, text, index, deleted, stamps)| {
            let mut block = Block::create(&BlockPatch::new(id), stamps[0].clone());
            block.kind = kind.to_string();
            block.data = Payload::from(serde_json::json!({ "text": text }));
            block.index = index;
            block.deleted = deleted;
            block.meta.kind = stamps[1].clone();
            block.meta.data = stamps[2].clone();
            block.meta.index = stamps[3].clone();
            block.meta.deleted = stamps[4].clone();
            block.last_edited_by = block.meta.latest().replica.clone();
            block
        })
}

// =============================================================================
// Merge laws
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn merge_is_commutative(a in arbitrary_block("b"), b in arbitrary_block("b")) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_idempotent(a in arbitrary_block("b"), b in arbitrary_block("b")) {
        prop_assert_eq!(a.merge(&a), a.clone());
        let once = a.merge(&b);
        prop_assert_eq!(once.merge(&b), once);
    }

    #[test]
    fn merge_is_associative(
        a in arbitrary_block("b"),
        b in arbitrary_block("b"),
        c in arbitrary_block("b"),
    ) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    /// Whatever order replicas receive the same states in, they converge.
    #[test]
    fn delivery_order_does_not_matter(
        states in prop::collection::vec(arbitrary_block("b"), 1..6),
    ) {
        let forward = states[1..].iter().fold(states[0].clone(), |acc, s| acc.merge(s));
        let mut reversed = states.clone();
        reversed.reverse();
        let backward = reversed[1..].iter().fold(reversed[0].clone(), |acc, s| acc.merge(s));
        prop_assert_eq!(forward, backward);
    }

    /// A content edit never flips the tombstone, whatever its stamp.
    #[test]
    fn content_edit_keeps_tombstone(
        a in arbitrary_block("b"),
        clock in 0u64..100,
        text in "[a-z]{1,5}",
    ) {
        let removed = a.patched(
            &BlockPatch::new("b").deleted(true),
            Stamp::new(a.latest_stamp().clock + 1, ReplicaId::from("r1")),
        );
        let edited = a.patched(
            &BlockPatch::new("b").data(Payload::from(serde_json::json!(text))).index(7),
            Stamp::new(clock, ReplicaId::from("r2")),
        );
        prop_assert!(removed.merge(&edited).deleted);
        prop_assert!(edited.merge(&removed).deleted);
    }
}

// =============================================================================
// Snapshot codec
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn snapshot_roundtrip(blocks in prop::collection::vec(arbitrary_block("x"), 0..4)) {
        // Distinct ids so the snapshot is a plausible document.
        let blocks: Vec<Block> = blocks
            .into_iter()
            .enumerate()
            .map(|(i, mut b)| {
                b.id = format!("block-{i}").into();
                b
            })
            .collect();
        let snapshot = DocumentSnapshot::from_blocks(blocks);
        let encoded = codec::encode(&snapshot).unwrap();
        prop_assert_eq!(codec::decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn decode_never_panics(input in "[A-Za-z0-9_-]{0,64}") {
        let _ = codec::decode(&input);
    }
}
