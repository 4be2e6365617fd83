mod common;

use std::collections::HashSet;

use common::*;
use gengc::{GcType, Heap, HeapConfig, NULL_ADDRESS};

const CHAIN_LEN: usize = 50_000;

#[test]
fn four_workers_evacuate_a_long_chain_exactly_once() {
    let heap = Heap::new(
        HeapConfig::default()
            .max_heap_size(64 << 20)
            .enable_concurrent_mark(false)
            .enable_concurrent_sweep(false)
            .enable_parallel_gc(true)
            .gc_thread_num(4),
    )
    .unwrap();
    let root = new_root(&heap);

    let mut prev = NULL_ADDRESS;
    for i in 0..CHAIN_LEN {
        let node = heap.allocate_young(&NODE).unwrap();
        store_word(node_data_slot(node), i);
        heap.write_field(node, ref_slot(node), prev);
        prev = node;
    }
    heap.write_root(root, prev);
    let old_head = prev;

    heap.collect_garbage(GcType::Young);

    // Walk the copied chain: every node present once, payload intact,
    // destination addresses all distinct.
    let mut seen = HashSet::new();
    let mut cursor = heap.read_field(root);
    assert_ne!(cursor, old_head, "head must have moved");
    let mut expected = CHAIN_LEN;
    while cursor != NULL_ADDRESS {
        expected -= 1;
        assert_eq!(load_word(node_data_slot(cursor)), expected);
        assert!(seen.insert(cursor), "duplicate copy at {cursor:#x}");
        cursor = heap.read_field(ref_slot(cursor));
    }
    assert_eq!(expected, 0);
    assert_eq!(seen.len(), CHAIN_LEN);
    assert!(heap.stats().evacuated_bytes >= CHAIN_LEN * NODE.size);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn single_worker_and_parallel_traces_agree() {
    let heap = Heap::new(
        HeapConfig::default()
            .max_heap_size(64 << 20)
            .enable_concurrent_mark(false)
            .enable_concurrent_sweep(false)
            .enable_parallel_gc(false)
            .gc_thread_num(1),
    )
    .unwrap();
    let root = new_root(&heap);

    let mut prev = NULL_ADDRESS;
    for i in 0..1000 {
        let node = heap.allocate_young(&NODE).unwrap();
        store_word(node_data_slot(node), i);
        heap.write_field(node, ref_slot(node), prev);
        prev = node;
    }
    heap.write_root(root, prev);

    heap.collect_garbage(GcType::Young);

    let mut cursor = heap.read_field(root);
    let mut count = 0;
    while cursor != NULL_ADDRESS {
        count += 1;
        cursor = heap.read_field(ref_slot(cursor));
    }
    assert_eq!(count, 1000);
}
