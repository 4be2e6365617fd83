//! Copying strategy for young collections.

use super::{MarkWorker, Marker, maybe_record_old_to_new, slot_value};
use crate::object::{Address, MarkWord, MarkWordValue, store_slot};
use crate::region::Region;

/// Evacuates live young objects out of the collect set, promoting survivors
/// of a previous young cycle (detected via the region age-mark watermark)
/// into the old space.
#[derive(Clone, Copy)]
pub struct SemiMarker;

impl Marker for SemiMarker {
    fn visit_slot(&self, worker: &mut MarkWorker<'_>, host: Address, slot: Address) {
        let Some(value) = slot_value(slot) else {
            return;
        };
        // SAFETY: non-null slot values are object base addresses.
        let region = unsafe { Region::from_object(value) };
        if !region.in_collect_set() {
            // Old objects, already-merged survivors and huge objects stay
            // put during a young collection.
            maybe_record_old_to_new(host, slot, value);
            return;
        }

        // SAFETY: collect-set objects keep a valid header until their source
        // region is reclaimed after the cycle.
        match unsafe { MarkWord::of(value).value() } {
            MarkWordValue::Forwarded(to) => {
                // Another worker already copied it; just fix this slot.
                unsafe { store_slot(slot, to) };
                maybe_record_old_to_new(host, slot, to);
            }
            MarkWordValue::Live(desc) => {
                let promote = region.below_water_line(value);
                worker.evacuate(host, slot, value, desc, promote);
            }
        }
    }
}
