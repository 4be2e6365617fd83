mod common;

use common::*;
use gengc::{GcType, Region, RegionKind};

#[test]
fn second_cycle_survivors_are_promoted() {
    let heap = stw_heap();

    // 1000 objects, every tenth one rooted.
    let mut roots = Vec::new();
    for i in 0..1000 {
        let leaf = heap.allocate_young(&LEAF).unwrap();
        store_word(leaf_data_slot(leaf), i);
        if i % 10 == 0 {
            let root = new_root(&heap);
            heap.write_root(root, leaf);
            roots.push((root, i));
        }
    }
    let used_before = heap.used();

    // First collection copies survivors within the young generation.
    heap.collect_garbage(GcType::Young);
    for &(root, _) in &roots {
        let survivor = heap.read_field(root);
        let region = unsafe { Region::from_object(survivor) };
        assert_eq!(region.kind(), RegionKind::Young);
    }

    // Second collection finds them below the age watermark and promotes.
    heap.collect_garbage(GcType::Young);
    for &(root, i) in &roots {
        let survivor = heap.read_field(root);
        let region = unsafe { Region::from_object(survivor) };
        assert_eq!(region.kind(), RegionKind::Old, "survivor {i} not promoted");
        assert_eq!(load_word(leaf_data_slot(survivor)), i);
    }

    assert!(heap.used() < used_before, "the other 900 must be reclaimed");
    assert!(heap.stats().promoted_bytes >= 100 * LEAF.size);
    assert_eq!(heap.verify_heap(), 0);
}

#[test]
fn objects_allocated_after_a_cycle_are_not_promoted_early() {
    let heap = stw_heap();
    heap.collect_garbage(GcType::Young);

    // Allocated after the watermark was sealed: one young collection must
    // keep it young.
    let root = new_root(&heap);
    let fresh = heap.allocate_young(&LEAF).unwrap();
    heap.write_root(root, fresh);

    heap.collect_garbage(GcType::Young);
    let survivor = heap.read_field(root);
    let region = unsafe { Region::from_object(survivor) };
    assert_eq!(region.kind(), RegionKind::Young);
}
