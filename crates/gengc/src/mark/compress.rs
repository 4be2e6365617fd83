//! Compacting strategy for full collections.

use super::{MarkWorker, Marker, maybe_record_old_to_new, slot_value};
use crate::object::{Address, MarkWord, MarkWordValue, NULL_ADDRESS, store_slot};
use crate::region::Region;

/// Full-heap compaction: every collect-set object (the whole young
/// generation plus the selected old regions) is evacuated into the compress
/// space; objects resident in non-movable, huge, read-only or machine-code
/// regions are marked in place instead of copied.
#[derive(Clone, Copy)]
pub struct CompressMarker;

impl CompressMarker {
    /// Whether the referenced region is compacted this cycle.
    #[inline]
    fn need_evacuate(region: &Region) -> bool {
        region.in_collect_set()
    }
}

impl Marker for CompressMarker {
    fn visit_slot(&self, worker: &mut MarkWorker<'_>, host: Address, slot: Address) {
        let Some(value) = slot_value(slot) else {
            return;
        };
        // SAFETY: non-null slot values are object base addresses.
        let region = unsafe { Region::from_object(value) };

        if !Self::need_evacuate(region) {
            if region.atomic_mark(value) {
                worker.push(value);
            }
            return;
        }

        // SAFETY: collect-set objects keep a valid header until their source
        // region is reclaimed after the cycle.
        match unsafe { MarkWord::of(value).value() } {
            MarkWordValue::Forwarded(to) => {
                unsafe { store_slot(slot, to) };
                record_patched_slot(host, slot);
                maybe_record_old_to_new(host, slot, to);
            }
            MarkWordValue::Live(desc) => {
                // The whole collect set compacts into the old generation.
                worker.evacuate(host, slot, value, desc, true);
                record_patched_slot(host, slot);
            }
        }
    }
}

/// Compaction bookkeeping: slots living outside the collect set that were
/// rewritten to point at relocated objects, kept so the post-cycle
/// verification pass can re-check exactly the patched references.
#[inline]
fn record_patched_slot(host: Address, slot: Address) {
    if host == NULL_ADDRESS {
        return;
    }
    // SAFETY: hosts are object base addresses in live regions.
    let host_region = unsafe { Region::from_object(host) };
    if !host_region.in_collect_set() {
        host_region.insert_cross_region_rset(slot);
    }
}
