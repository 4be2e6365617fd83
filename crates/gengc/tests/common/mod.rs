#![allow(dead_code)]

use std::sync::Arc;

use gengc::{
    Address, HEADER_SIZE, Heap, HeapConfig, SLOT_SIZE, SlotVisitor, TypeDescriptor,
};

pub fn no_refs(_: Address, _: &mut dyn SlotVisitor) {}

pub fn visit_node(object: Address, visitor: &mut dyn SlotVisitor) {
    visitor.visit_slot(object, object + HEADER_SIZE);
}

pub fn visit_weak_holder(object: Address, visitor: &mut dyn SlotVisitor) {
    visitor.visit_weak_slot(object, object + HEADER_SIZE);
}

/// Header plus one data word.
pub static LEAF: TypeDescriptor = TypeDescriptor {
    size: 2 * SLOT_SIZE,
    flags: 0,
    visit_refs: no_refs,
};

/// Header, one reference field, one data word.
pub static NODE: TypeDescriptor = TypeDescriptor {
    size: 3 * SLOT_SIZE,
    flags: TypeDescriptor::FLAG_HAS_REFS,
    visit_refs: visit_node,
};

/// Header plus one weak reference field.
pub static WEAK_HOLDER: TypeDescriptor = TypeDescriptor {
    size: 2 * SLOT_SIZE,
    flags: TypeDescriptor::FLAG_HAS_REFS,
    visit_refs: visit_weak_holder,
};

/// Deterministic single-threaded stop-the-world configuration.
pub fn stw_config() -> HeapConfig {
    HeapConfig::default()
        .max_heap_size(64 << 20)
        .enable_concurrent_mark(false)
        .enable_concurrent_sweep(false)
        .gc_thread_num(2)
}

pub fn stw_heap() -> Arc<Heap> {
    Heap::new(stw_config()).unwrap()
}

/// Leaks one word to act as a registered root slot.
pub fn new_root(heap: &Heap) -> Address {
    let slot = Box::leak(Box::new(0usize)) as *mut usize as Address;
    heap.add_root(slot);
    slot
}

/// Address of an object's reference field (`NODE`/`WEAK_HOLDER` layout).
pub fn ref_slot(object: Address) -> Address {
    object + HEADER_SIZE
}

/// Address of a `NODE`'s data word.
pub fn node_data_slot(object: Address) -> Address {
    object + 2 * SLOT_SIZE
}

/// Address of a `LEAF`'s data word.
pub fn leaf_data_slot(object: Address) -> Address {
    object + HEADER_SIZE
}

pub fn store_word(addr: Address, value: usize) {
    unsafe { std::ptr::write_volatile(addr as *mut usize, value) }
}

pub fn load_word(addr: Address) -> usize {
    unsafe { std::ptr::read_volatile(addr as *const usize) }
}
