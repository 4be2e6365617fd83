mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use gengc::{
    Address, GcType, Heap, HeapConfig, NULL_ADDRESS, SLOT_SIZE, SlotVisitor, TypeDescriptor,
};

fn no_refs_page(_: Address, _: &mut dyn SlotVisitor) {}

static PAGE: TypeDescriptor = TypeDescriptor {
    size: 512 * SLOT_SIZE,
    flags: 0,
    visit_refs: no_refs_page,
};

fn concurrent_heap() -> Arc<Heap> {
    Heap::new(
        HeapConfig::default()
            .max_heap_size(64 << 20)
            .min_semi_space_size(2 << 20)
            .max_semi_space_size(2 << 20)
            .enable_concurrent_mark(true)
            .enable_concurrent_sweep(true)
            .gc_thread_num(2),
    )
    .unwrap()
}

#[test]
fn marking_runs_while_the_mutator_keeps_allocating() {
    let heap = concurrent_heap();
    let root = new_root(&heap);

    let mut prev = NULL_ADDRESS;
    for i in 0..100 {
        let node = heap.allocate_young(&NODE).unwrap();
        store_word(node_data_slot(node), i);
        heap.write_field(node, ref_slot(node), prev);
        prev = node;
    }
    heap.write_root(root, prev);

    // Push young usage past the eager trigger with short-lived garbage;
    // the allocation path may start the trace on its own along the way.
    for _ in 0..100_000 {
        heap.allocate_young(&LEAF).unwrap();
    }
    assert!(
        heap.try_trigger_concurrent_marking() || heap.concurrent_marking_active(),
        "trigger threshold was crossed"
    );

    // Keep mutating while the background trace runs: prepend fifty nodes,
    // rewiring the root each time.
    let mutator = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for i in 100..150 {
                let node = heap.allocate_young(&NODE).unwrap();
                store_word(node_data_slot(node), i);
                heap.write_field(node, ref_slot(node), heap.read_field(root));
                heap.write_root(root, node);
            }
        })
    };
    mutator.join().unwrap();

    heap.collect_garbage(GcType::Young);

    let mut cursor = heap.read_field(root);
    let mut expected = 150;
    while cursor != NULL_ADDRESS {
        expected -= 1;
        assert_eq!(load_word(node_data_slot(cursor)), expected);
        cursor = heap.read_field(ref_slot(cursor));
    }
    assert_eq!(expected, 0, "nodes added during marking must survive");
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn a_finished_full_trace_feeds_an_old_collection() {
    let heap = concurrent_heap();

    // 500 rooted pages plus 700 dead ones: enough old-generation pressure
    // to demand a full trace, with plenty for the sweep to reclaim.
    let mut roots = Vec::new();
    for i in 0..500 {
        let page = heap.allocate_old(&PAGE).unwrap();
        store_word(leaf_data_slot(page), i);
        let root = new_root(&heap);
        heap.write_root(root, page);
        roots.push((root, i));
    }
    for _ in 0..700 {
        heap.allocate_old(&PAGE).unwrap();
    }

    // An old object pointing at a young one, mutated during the trace.
    let host_root = new_root(&heap);
    let host = heap.allocate_old(&NODE).unwrap();
    heap.write_root(host_root, host);

    assert!(
        heap.try_trigger_concurrent_marking() || heap.concurrent_marking_active(),
        "old-generation pressure must start a full trace"
    );

    let mutator = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for i in 0..100 {
                let leaf = heap.allocate_young(&LEAF).unwrap();
                store_word(leaf_data_slot(leaf), 1000 + i);
                let host = heap.read_field(host_root);
                heap.write_field(host, ref_slot(host), leaf);
            }
        })
    };
    mutator.join().unwrap();

    let used_before = heap.used();
    heap.collect_garbage(GcType::Old);

    // verify_heap waits out the background sweeps before walking.
    assert_eq!(heap.verify_heap(), 0);
    assert_eq!(heap.stats().old_gc_count, 1);
    assert!(heap.used() < used_before, "dead pages must be swept");

    for &(root, i) in &roots {
        let page = heap.read_field(root);
        assert_eq!(load_word(leaf_data_slot(page)), i);
    }
    let host = heap.read_field(host_root);
    let leaf = heap.read_field(ref_slot(host));
    assert_eq!(load_word(leaf_data_slot(leaf)), 1099);
}

#[test]
fn allocation_pressure_starts_marking_without_an_explicit_call() {
    let heap = concurrent_heap();
    let root = new_root(&heap);
    let keep = heap.allocate_young(&NODE).unwrap();
    store_word(node_data_slot(keep), 9);
    heap.write_root(root, keep);

    // Enough allocation to cross the eager trigger, but not enough to force
    // a young collection: the heap must start the trace on its own.
    for _ in 0..110_000 {
        heap.allocate_young(&LEAF).unwrap();
    }
    assert!(
        heap.concurrent_marking_active(),
        "no trace was started from the allocation path"
    );

    heap.collect_garbage(GcType::Young);
    let survivor = heap.read_field(root);
    assert_ne!(survivor, NULL_ADDRESS);
    assert_eq!(load_word(node_data_slot(survivor)), 9);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn the_trigger_declines_when_concurrent_marking_is_disabled() {
    let heap = stw_heap();
    for _ in 0..120_000 {
        heap.allocate_young(&LEAF).unwrap();
    }
    assert!(!heap.try_trigger_concurrent_marking());
}
