//! Mark-in-place strategy for non-compacting passes.

use super::{MarkWorker, Marker, maybe_record_old_to_new, slot_value};
use crate::object::Address;
use crate::region::{Region, RegionKind};

/// Sets region mark bits without moving anything. Used by the concurrent
/// marker for full traces and by the compactor for regions outside the
/// collect set.
#[derive(Clone, Copy)]
pub struct NonMovableMarker {
    /// Restrict the trace to the young generation; objects elsewhere are
    /// outside the collected generation and are skipped.
    pub young_only: bool,
}

impl Marker for NonMovableMarker {
    fn visit_slot(&self, worker: &mut MarkWorker<'_>, host: Address, slot: Address) {
        let Some(value) = slot_value(slot) else {
            return;
        };
        // SAFETY: non-null slot values are object base addresses.
        let region = unsafe { Region::from_object(value) };
        if self.young_only && region.kind() != RegionKind::Young {
            return;
        }
        maybe_record_old_to_new(host, slot, value);
        if region.atomic_mark(value) {
            worker.push(value);
        }
    }
}
