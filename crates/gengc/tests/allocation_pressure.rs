mod common;

use common::*;
use gengc::{
    AllocError, Address, Heap, HeapConfig, SLOT_SIZE, SlotVisitor, TypeDescriptor,
};

fn no_refs64(_: Address, _: &mut dyn SlotVisitor) {}

static BLOCK: TypeDescriptor = TypeDescriptor {
    size: 8 * SLOT_SIZE,
    flags: 0,
    visit_refs: no_refs64,
};

static MEGA: TypeDescriptor = TypeDescriptor {
    size: 1 << 20,
    flags: 0,
    visit_refs: no_refs64,
};

/// Smallest valid heap: 12 MiB of fixed spaces, two 2 MiB young halves and
/// a 4 MiB old generation. Single worker keeps compaction packing exact.
fn tight_heap() -> std::sync::Arc<Heap> {
    Heap::new(
        HeapConfig::default()
            .max_heap_size(20 << 20)
            .min_semi_space_size(2 << 20)
            .max_semi_space_size(2 << 20)
            .enable_concurrent_mark(false)
            .enable_concurrent_sweep(false)
            .enable_parallel_gc(false)
            .gc_thread_num(1),
    )
    .unwrap()
}

#[test]
fn exhausting_the_old_generation_is_a_deterministic_error() {
    let heap = tight_heap();

    // Root everything so no collection can make room.
    let mut count = 0usize;
    let error = loop {
        match heap.allocate_old(&BLOCK) {
            Ok(block) => {
                let root = new_root(&heap);
                heap.write_root(root, block);
                store_word(leaf_data_slot(block), count);
                count += 1;
            }
            Err(err) => break err,
        }
        assert!(count < 100_000, "old space never reported exhaustion");
    };

    assert!(matches!(error, AllocError::OutOfMemory { space: "old", .. }));
    // The hard cap held even through the overshoot allowance.
    assert!(heap.committed() <= 20 << 20);
    // Nothing was lost on the way to the error.
    assert!(count * BLOCK.size <= 4 << 20);
    assert!(count * BLOCK.size >= 3 << 20, "old space barely used: {count}");
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn exhausting_the_huge_space_is_a_deterministic_error() {
    let heap = tight_heap();

    let mut roots = Vec::new();
    let error = loop {
        match heap.allocate_huge(&MEGA) {
            Ok(object) => {
                let root = new_root(&heap);
                heap.write_root(root, object);
                roots.push(root);
            }
            Err(err) => break err,
        }
        assert!(roots.len() < 64, "huge space never reported exhaustion");
    };
    assert!(matches!(
        error,
        AllocError::OutOfMemory { space: "huge", .. }
    ));
    assert!(!roots.is_empty());

    // The rooted huge objects survived the desperation collection.
    for &root in &roots {
        assert_ne!(heap.read_field(root), 0);
    }
}

#[test]
fn collection_makes_room_instead_of_failing() {
    let heap = tight_heap();

    // Fill the old generation with garbage, then keep allocating: every
    // request must succeed because compaction reclaims the dead blocks.
    for round in 0..8 {
        for _ in 0..10_000 {
            heap.allocate_old(&BLOCK)
                .unwrap_or_else(|err| panic!("round {round}: {err}"));
        }
    }
    assert!(heap.stats().full_gc_count >= 1);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn young_allocation_recovers_after_collection() {
    let heap = tight_heap();
    // Several times the semi-space capacity of short-lived objects.
    for _ in 0..200_000 {
        heap.allocate_young(&LEAF).unwrap();
    }
    assert!(heap.stats().young_gc_count >= 1);
}
