mod common;

use common::*;
use gengc::{GcType, NULL_ADDRESS, Region, RegionKind};

#[test]
fn old_to_young_edges_keep_their_referents_alive() {
    let heap = stw_heap();

    // The only path to the leaf is a field of an old object.
    let host = heap.allocate_old(&NODE).unwrap();
    let leaf = heap.allocate_young(&LEAF).unwrap();
    store_word(leaf_data_slot(leaf), 42);
    heap.write_field(host, ref_slot(host), leaf);

    heap.collect_garbage(GcType::Young);

    let survivor = heap.read_field(ref_slot(host));
    assert_ne!(survivor, NULL_ADDRESS);
    assert_ne!(survivor, leaf, "referent must have been evacuated");
    assert_eq!(load_word(leaf_data_slot(survivor)), 42);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn the_set_is_rebuilt_while_the_edge_stays_young() {
    let heap = stw_heap();
    let host = heap.allocate_old(&NODE).unwrap();
    let leaf = heap.allocate_young(&LEAF).unwrap();
    store_word(leaf_data_slot(leaf), 7);
    heap.write_field(host, ref_slot(host), leaf);

    // Short-lived churn keeps the survival heuristics from upgrading the
    // second cycle.
    for _ in 0..200 {
        heap.allocate_young(&LEAF).unwrap();
    }

    // First cycle: the survivor is still young, so the trace must have
    // re-recorded the slot for the second cycle to find.
    heap.collect_garbage(GcType::Young);
    let region = unsafe { Region::from_object(heap.read_field(ref_slot(host))) };
    assert_eq!(region.kind(), RegionKind::Young);

    // Second cycle promotes it; the slot then points old-to-old.
    heap.collect_garbage(GcType::Young);
    let survivor = heap.read_field(ref_slot(host));
    let region = unsafe { Region::from_object(survivor) };
    assert_eq!(region.kind(), RegionKind::Old);
    assert_eq!(load_word(leaf_data_slot(survivor)), 7);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn cleared_edges_let_the_referent_die() {
    let heap = stw_heap();
    let host = heap.allocate_old(&NODE).unwrap();
    let leaf = heap.allocate_young(&LEAF).unwrap();
    heap.write_field(host, ref_slot(host), leaf);
    heap.write_field(host, ref_slot(host), NULL_ADDRESS);

    let used_before = heap.used();
    heap.collect_garbage(GcType::Young);

    assert_eq!(heap.read_field(ref_slot(host)), NULL_ADDRESS);
    assert!(heap.used() < used_before);
}

#[test]
fn overwritten_edges_track_the_newest_referent() {
    let heap = stw_heap();
    let host = heap.allocate_old(&NODE).unwrap();
    let first = heap.allocate_young(&LEAF).unwrap();
    store_word(leaf_data_slot(first), 1);
    heap.write_field(host, ref_slot(host), first);

    let second = heap.allocate_young(&LEAF).unwrap();
    store_word(leaf_data_slot(second), 2);
    heap.write_field(host, ref_slot(host), second);

    heap.collect_garbage(GcType::Young);
    let survivor = heap.read_field(ref_slot(host));
    assert_eq!(load_word(leaf_data_slot(survivor)), 2);
}
