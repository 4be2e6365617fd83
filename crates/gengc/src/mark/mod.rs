//! The polymorphic marker family and the shared traversal engine.
//!
//! The three markers differ only in what happens when a slot's referent is
//! confirmed reachable: mark in place ([`NonMovableMarker`]), copy with
//! generational promotion ([`SemiMarker`]), or conditionally compact
//! ([`CompressMarker`]). The traversal itself — root handling, the iterative
//! gray-object queue, remembered-set replay — is shared and never recurses
//! on the object graph, so arbitrarily deep or cyclic graphs cannot overflow
//! the call stack.

mod compress;
mod non_movable;
mod semi;

pub use compress::CompressMarker;
pub use non_movable::NonMovableMarker;
pub use semi::SemiMarker;

use tracing::error;

use crate::object::{
    Address, MarkWord, MarkWordValue, NULL_ADDRESS, SlotVisitor, load_slot, store_slot,
};
use crate::region::{Region, RegionKind};
use crate::work::{LocalBuffer, WeakSlot, WorkManager};

/// One marker strategy. `visit_slot` decides reachability and relocation for
/// the object referenced by `slot`; the shared engine does everything else.
pub trait Marker: Copy + Send + Sync + 'static {
    fn visit_slot(&self, worker: &mut MarkWorker<'_>, host: Address, slot: Address);
}

/// Per-thread traversal state: the worker's deque handle, its destination
/// buffers and its contribution to the cycle statistics.
pub struct MarkWorker<'h> {
    id: usize,
    work: &'h WorkManager,
    pub young_buffer: Option<LocalBuffer<'h>>,
    pub old_buffer: Option<LocalBuffer<'h>>,
    pub evacuated_bytes: usize,
    pub promoted_bytes: usize,
    pub marked_bytes: usize,
}

impl<'h> MarkWorker<'h> {
    #[must_use]
    pub fn new(
        id: usize,
        work: &'h WorkManager,
        young_buffer: Option<LocalBuffer<'h>>,
        old_buffer: Option<LocalBuffer<'h>>,
    ) -> Self {
        Self {
            id,
            work,
            young_buffer,
            old_buffer,
            evacuated_bytes: 0,
            promoted_bytes: 0,
            marked_bytes: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, object: Address) {
        self.work.push(self.id, object);
    }

    /// Drains this worker's queue, stealing from siblings when it runs dry,
    /// until the phase-wide termination protocol declares the graph fully
    /// traversed.
    pub fn process_mark_stack<M: Marker>(&mut self, marker: M) {
        loop {
            while let Some(object) = self.work.take(self.id) {
                self.scan_object(object, marker);
            }
            if self.work.try_terminate(self.id) {
                return;
            }
        }
    }

    /// Visits every reference field of one gray object.
    fn scan_object<M: Marker>(&mut self, object: Address, marker: M) {
        // SAFETY: only addresses of installed objects enter the work queues.
        let desc = match unsafe { MarkWord::of(object).value() } {
            MarkWordValue::Live(desc) => desc,
            MarkWordValue::Forwarded(_) => return,
        };
        self.marked_bytes += desc.size;
        if !desc.has_reference_fields() {
            return;
        }
        let mut visitor = FieldVisitor {
            worker: self,
            marker,
        };
        (desc.visit_refs)(object, &mut visitor);
    }

    /// Copies `value` out of its collect-set region, updates `slot`, and
    /// pushes the new copy for scanning. Exactly one racing worker wins the
    /// header CAS; losers roll their private copy back and adopt the
    /// winner's forwarding address.
    fn evacuate(
        &mut self,
        host: Address,
        slot: Address,
        value: Address,
        desc: &'static crate::object::TypeDescriptor,
        promote: bool,
    ) {
        let size = desc.size;
        // SAFETY: `value` is an object base address in a live region.
        let from_young = unsafe { Region::from_object(value) }.kind() == RegionKind::Young;
        let (destination, promoted) = self.evacuation_target(size, promote);

        // SAFETY: source and destination are distinct live allocations of
        // `size` bytes; the copy duplicates the header, so the destination
        // is a well-formed object the moment the CAS below publishes it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                value as *const u8,
                destination as *mut u8,
                size,
            );
        }

        // SAFETY: `value` held a live header for `desc` when this slot was
        // read; the CAS re-checks that under contention.
        match unsafe { MarkWord::of(value) }.try_forward(desc, destination) {
            Ok(()) => {
                unsafe { store_slot(slot, destination) };
                maybe_record_old_to_new(host, slot, destination);
                self.evacuated_bytes += size;
                // Old-to-old compaction copies are not promotions.
                if promoted && from_young {
                    self.promoted_bytes += size;
                }
                self.push(destination);
            }
            Err(winner) => {
                let buffer = if promoted {
                    self.old_buffer.as_mut()
                } else {
                    self.young_buffer.as_mut()
                };
                if let Some(buffer) = buffer {
                    buffer.undo(destination, size);
                }
                unsafe { store_slot(slot, winner) };
                maybe_record_old_to_new(host, slot, winner);
            }
        }
    }

    /// Picks a destination for `size` bytes, preferring the requested
    /// generation but falling back to the other one under space pressure.
    /// Exhausting both mid-evacuation means the concurrency protocol's
    /// accounting was violated, which is fatal.
    fn evacuation_target(&mut self, size: usize, promote: bool) -> (Address, bool) {
        if promote {
            if let Some(addr) = self.old_buffer.as_mut().and_then(|b| b.allocate(size)) {
                return (addr, true);
            }
            if let Some(addr) = self.young_buffer.as_mut().and_then(|b| b.allocate(size)) {
                return (addr, false);
            }
        } else {
            if let Some(addr) = self.young_buffer.as_mut().and_then(|b| b.allocate(size)) {
                return (addr, false);
            }
            if let Some(addr) = self.old_buffer.as_mut().and_then(|b| b.allocate(size)) {
                return (addr, true);
            }
        }
        error!(size, promote, "evacuation destination exhausted");
        panic!("heap exhausted while evacuating live objects");
    }

    /// Merges destination buffers back into their spaces. Called once per
    /// worker at phase end.
    pub fn merge_buffers(&mut self) {
        if let Some(buffer) = self.young_buffer.take() {
            buffer.merge();
        }
        if let Some(buffer) = self.old_buffer.take() {
            buffer.merge();
        }
    }
}

struct FieldVisitor<'a, 'h, M: Marker> {
    worker: &'a mut MarkWorker<'h>,
    marker: M,
}

impl<M: Marker> SlotVisitor for FieldVisitor<'_, '_, M> {
    fn visit_slot(&mut self, host: Address, slot: Address) {
        self.marker.visit_slot(self.worker, host, slot);
    }

    fn visit_weak_slot(&mut self, _host: Address, slot: Address) {
        self.worker.work.push_weak(WeakSlot { slot });
    }
}

/// Rebuilds the old-to-new remembered set as evacuating traces rewrite
/// slots: any slot in an older-generation host that still refers to a young
/// object after the update must stay recorded for the next young cycle.
#[inline]
pub(crate) fn maybe_record_old_to_new(host: Address, slot: Address, value: Address) {
    if host == NULL_ADDRESS || value == NULL_ADDRESS {
        return;
    }
    // SAFETY: hosts and values handed to markers are object base addresses
    // in live regions.
    let host_region = unsafe { Region::from_object(host) };
    if host_region.kind() == RegionKind::Young {
        return;
    }
    let value_region = unsafe { Region::from_object(value) };
    if value_region.kind() == RegionKind::Young {
        host_region.insert_old_to_new_rset(slot);
    }
}

/// Reads a slot's referent, if any.
#[inline]
pub(crate) fn slot_value(slot: Address) -> Option<Address> {
    // SAFETY: markers only receive mapped, aligned slot addresses.
    let value = unsafe { load_slot(slot) };
    (value != NULL_ADDRESS).then_some(value)
}
