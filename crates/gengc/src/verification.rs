//! Optional whole-heap consistency checks.
//!
//! The verifier walks every live object the same way the markers do and
//! confirms the structural invariants a quiescent heap must satisfy: no slot
//! holds a stale forwarding pointer, every referent carries an installed
//! header, and every old-generation slot that refers to a young object is
//! present in its region's old-to-new remembered set. With
//! `enable_heap_verify` set the heap runs these checks around every
//! collection and aborts on the first failing cycle.

use tracing::error;

use crate::heap::Heap;
use crate::object::{
    Address, MarkWord, MarkWordValue, NULL_ADDRESS, SLOT_SIZE, SlotVisitor, load_slot,
};
use crate::region::{Region, RegionKind};

/// Checks every reachable slot of every object (and every root) for dangling
/// or malformed references. Returns the number of failures.
///
/// Must run on a quiescent heap: no collection, trace or sweep in flight.
pub(crate) fn verify_heap(heap: &Heap) -> usize {
    let mut visitor = RefVisitor { failures: 0 };
    heap.iterate_over_objects(|object| {
        // SAFETY: iteration yields installed object base addresses.
        match unsafe { MarkWord::of(object).value() } {
            MarkWordValue::Live(desc) => {
                if desc.has_reference_fields() {
                    (desc.visit_refs)(object, &mut visitor);
                }
            }
            MarkWordValue::Forwarded(to) => {
                error!(object, to, "forwarded header outside a collection cycle");
                visitor.failures += 1;
            }
        }
    });
    heap.for_each_root(|slot| visitor.check(NULL_ADDRESS, slot));
    visitor.failures
}

/// Checks old-to-new remembered-set completeness (every old-generation slot
/// holding a young reference is recorded) and re-checks the slots the last
/// compaction patched. Returns the number of failures.
pub(crate) fn verify_old_to_new(heap: &Heap) -> usize {
    let mut visitor = OldToNewVisitor { failures: 0 };
    heap.iterate_over_objects(|object| {
        // SAFETY: iteration yields installed object base addresses.
        if let MarkWordValue::Live(desc) = unsafe { MarkWord::of(object).value() } {
            if desc.has_reference_fields() {
                (desc.visit_refs)(object, &mut visitor);
            }
        }
    });

    let mut failures = visitor.failures;
    heap.for_each_old_generation_region(|region| {
        region.iterate_cross_region(|slot| {
            // SAFETY: recorded slots live in mapped regions.
            let value = unsafe { load_slot(slot) };
            if value == NULL_ADDRESS {
                return;
            }
            if let MarkWordValue::Forwarded(to) = unsafe { MarkWord::of(value).value() } {
                error!(slot, value, to, "patched slot still holds a forwarding pointer");
                failures += 1;
            }
        });
    });
    failures
}

struct RefVisitor {
    failures: usize,
}

impl RefVisitor {
    fn check(&mut self, host: Address, slot: Address) {
        // SAFETY: slots come from descriptor enumeration or the root list.
        let value = unsafe { load_slot(slot) };
        if value == NULL_ADDRESS {
            return;
        }
        if value % SLOT_SIZE != 0 {
            error!(host, slot, value, "unaligned reference");
            self.failures += 1;
            return;
        }
        // SAFETY: alignment was checked; a corrupt pointer would already
        // have poisoned the trace that produced this heap.
        if let MarkWordValue::Forwarded(to) = unsafe { MarkWord::of(value).value() } {
            error!(host, slot, value, to, "reference to a forwarded object");
            self.failures += 1;
        }
    }
}

impl SlotVisitor for RefVisitor {
    fn visit_slot(&mut self, host: Address, slot: Address) {
        self.check(host, slot);
    }

    fn visit_weak_slot(&mut self, host: Address, slot: Address) {
        self.check(host, slot);
    }
}

struct OldToNewVisitor {
    failures: usize,
}

impl OldToNewVisitor {
    fn check(&mut self, host: Address, slot: Address) {
        // SAFETY: slots come from descriptor enumeration of live objects.
        let value = unsafe { load_slot(slot) };
        if host == NULL_ADDRESS || value == NULL_ADDRESS {
            return;
        }
        // SAFETY: hosts and aligned referents are object base addresses.
        let host_region = unsafe { Region::from_object(host) };
        if host_region.kind() == RegionKind::Young {
            return;
        }
        let value_region = unsafe { Region::from_object(value) };
        if value_region.kind() != RegionKind::Young {
            return;
        }
        if !host_region.old_to_new_contains(slot) {
            error!(host, slot, value, "old-to-new edge missing from remembered set");
            self.failures += 1;
        }
    }
}

impl SlotVisitor for OldToNewVisitor {
    fn visit_slot(&mut self, host: Address, slot: Address) {
        self.check(host, slot);
    }

    fn visit_weak_slot(&mut self, host: Address, slot: Address) {
        self.check(host, slot);
    }
}
