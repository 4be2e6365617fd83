//! Lazy sweeping of mark-in-place spaces.
//!
//! After a remark pause the heap snapshots the region lists of the swept
//! spaces, resets their free lists and flags every snapshot region as
//! sweeping, all before the mutator resumes. The sweeper then rebuilds each
//! space's free list from the mark bits, either inline or on pool threads
//! overlapping the mutator. While a region carries the sweeping flag the
//! write barrier diverts its remembered-set inserts to a side set that is
//! merged back once the region is done, so concurrent bit clearing over
//! freed spans never races the mutator.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

use crate::heap::Heap;
use crate::object::{SLOT_SIZE, align_up, size_of_object};
use crate::region::Region;
use crate::space::SparseSpace;

/// Which space a sweep task rebuilds.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SweepTarget {
    Old,
    NonMovable,
    MachineCode,
}

/// A region pointer detached from its owning space's lock for the duration
/// of a sweep. The heap keeps the owning `Box<Region>` alive until
/// [`Sweeper::ensure_all_tasks_finished`] has been observed.
pub(crate) struct RegionPtr(*const Region);

// SAFETY: the pointee is never moved or freed while a sweep task holds the
// pointer, and all Region state touched by the sweeper is atomic.
unsafe impl Send for RegionPtr {}

impl RegionPtr {
    pub(crate) fn new(region: &Region) -> Self {
        Self(std::ptr::from_ref(region))
    }
}

pub(crate) struct Sweeper {
    pending: Mutex<usize>,
    finished_cv: Condvar,
}

impl Sweeper {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            finished_cv: Condvar::new(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        *self.pending.lock() == 0
    }

    /// Blocks until every posted sweep task has completed.
    pub(crate) fn ensure_all_tasks_finished(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.finished_cv.wait(&mut pending);
        }
    }

    /// Sweeps one space's snapshot, on a pool thread when `concurrent`.
    pub(crate) fn post(
        &self,
        heap: &Arc<Heap>,
        target: SweepTarget,
        regions: Vec<RegionPtr>,
        concurrent: bool,
    ) {
        if regions.is_empty() {
            return;
        }
        *self.pending.lock() += 1;
        if concurrent {
            let pool = heap.pool();
            let heap = Arc::clone(heap);
            pool.post(move || {
                sweep_snapshot(&heap, target, &regions);
                heap.sweeper().task_done();
            });
        } else {
            sweep_snapshot(heap, target, &regions);
            self.task_done();
        }
    }

    fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.finished_cv.notify_all();
        }
    }
}

fn sweep_snapshot(heap: &Heap, target: SweepTarget, regions: &[RegionPtr]) {
    let space = heap.sweep_space(target);
    let mut freed = 0;
    for ptr in regions {
        // SAFETY: the snapshot protocol keeps the region alive and in place
        // until the sweep is observed finished.
        let region = unsafe { &*ptr.0 };
        freed += sweep_region(region, space);
    }
    debug!(?target, regions = regions.len(), freed, "sweep finished");
}

/// Rebuilds the free spans of one region from its mark bits: every maximal
/// run of unmarked objects (dead objects and stale free spans alike)
/// becomes one span on the space's free list. Returns the bytes freed.
pub(crate) fn sweep_region(region: &Region, space: &SparseSpace) -> usize {
    if region.is_fresh_during_mark() {
        // Allocated while the trace ran; everything in it is implicitly
        // live this cycle.
        region.set_fresh_during_mark(false);
        finish_region(region);
        return 0;
    }

    let mut spans: Vec<(usize, usize)> = Vec::new();
    let top = region.top();
    let mut cursor = region.begin();
    let mut dead_start = None;
    while cursor < top {
        // SAFETY: region payloads are a gap-free sequence of object and
        // free-span headers from begin() to top().
        let size = align_up(unsafe { size_of_object(cursor) }, SLOT_SIZE);
        if region.is_marked(cursor) {
            if let Some(start) = dead_start.take() {
                spans.push((start, cursor - start));
            }
        } else if dead_start.is_none() {
            dead_start = Some(cursor);
        }
        cursor += size;
    }
    if let Some(start) = dead_start {
        spans.push((start, top - start));
    }

    let mut freed = 0;
    for &(start, len) in &spans {
        // Stale old-to-new entries inside reclaimed spans must not survive
        // into the next young cycle.
        region.clear_old_to_new_range(start, start + len);
        freed += len;
    }
    space.merge_free_spans(&spans);
    finish_region(region);
    freed
}

fn finish_region(region: &Region) {
    region.set_sweeping(false);
    // Barrier inserts diverted while the flag was up become ordinary
    // old-to-new entries again.
    region.merge_sweeping_rset();
}
