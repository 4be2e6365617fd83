//! Background marking that overlaps the mutator.
//!
//! A concurrent trace runs the mark-in-place strategy on pool threads while
//! the mutator keeps allocating. Soundness against a racing mutator rests on
//! three mechanisms owned here and in the heap: objects allocated during the
//! trace start marked (allocate-black), regions created during the trace are
//! flagged so the sweeper skips them wholesale, and every reference the
//! mutator overwrites is pushed through [`ConcurrentMarker::push_barrier_value`]
//! and re-traced at the stop-the-world remark.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::heap::Heap;
use crate::mark::{MarkWorker, NonMovableMarker};
use crate::object::{Address, NULL_ADDRESS, load_slot};
use crate::region::{Region, RegionKind};
use crate::work::WorkManager;

const IDLE: u8 = 0;
const MARKING: u8 = 1;
const FINISHED: u8 = 2;

/// Where the background trace currently stands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum MarkState {
    /// No trace in flight; mark bits are stale.
    Idle,
    /// Pool workers are draining the gray set.
    Marking,
    /// The trace converged; a remark pause can consume the bits.
    Finished,
}

pub(crate) struct ConcurrentMarker {
    state: AtomicU8,
    full_mark: AtomicBool,
    /// Values overwritten by the mutator while the trace is live; replayed
    /// at remark so no reachable object hides behind a deleted edge.
    barrier_buffer: SegQueue<Address>,
    pending_workers: AtomicUsize,
    marked_bytes: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    state_lock: Mutex<()>,
    finished_cv: Condvar,
}

impl ConcurrentMarker {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            full_mark: AtomicBool::new(false),
            barrier_buffer: SegQueue::new(),
            pending_workers: AtomicUsize::new(0),
            marked_bytes: AtomicUsize::new(0),
            started_at: Mutex::new(None),
            state_lock: Mutex::new(()),
            finished_cv: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> MarkState {
        match self.state.load(Ordering::SeqCst) {
            MARKING => MarkState::Marking,
            FINISHED => MarkState::Finished,
            _ => MarkState::Idle,
        }
    }

    /// True while mark bits are being produced or waiting to be consumed;
    /// the write barrier and allocate-black stay on for both.
    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) != IDLE
    }

    pub(crate) fn is_full_mark(&self) -> bool {
        self.full_mark.load(Ordering::SeqCst)
    }

    pub(crate) fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::SeqCst)
    }

    /// Deletion-barrier hook: remembers the overwritten referent.
    #[inline]
    pub(crate) fn push_barrier_value(&self, value: Address) {
        if value != NULL_ADDRESS && self.is_active() {
            self.barrier_buffer.push(value);
        }
    }

    /// Starts a background trace. Returns `false` when one is already in
    /// flight or its results are still pending consumption.
    pub(crate) fn try_start(&self, heap: &Arc<Heap>, full: bool) -> bool {
        if self.state.load(Ordering::SeqCst) != IDLE {
            return false;
        }
        // Mark bits about to be cleared must not be read by a sweep.
        heap.sweeper().ensure_all_tasks_finished();
        // Bits are cleared before the state flips: allocate-black starts
        // only once nothing can erase its mark.
        heap.clear_mark_bits(full);
        if self
            .state
            .compare_exchange(IDLE, MARKING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.full_mark.store(full, Ordering::SeqCst);
        self.marked_bytes.store(0, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());
        debug!(full, "concurrent mark started");

        let work = heap.work();
        heap.for_each_root(|slot| seed_slot(work, slot, full));
        if full {
            // Immortal objects are unconditionally live but their fields
            // still anchor parts of the collectible graph.
            heap.for_each_immortal_object(|object| seed_value(work, object, true));
        } else {
            // Old-to-new edges are roots of a young-bounded trace. Replayed
            // non-destructively: the sets stay intact for the next young GC.
            heap.for_each_old_generation_region(|region| {
                region.iterate_old_to_new(|slot| seed_slot(work, slot, full));
            });
        }

        let pool = heap.pool();
        let workers = pool.thread_count().min(work.worker_count()).max(1);
        work.begin_phase(workers);
        self.pending_workers.store(workers, Ordering::SeqCst);
        for id in 0..workers {
            let heap = Arc::clone(heap);
            pool.post(move || {
                let mut worker = MarkWorker::new(id, heap.work(), None, None);
                worker.process_mark_stack(NonMovableMarker { young_only: !full });
                heap.concurrent_marker()
                    .finish_worker(&heap, worker.marked_bytes);
            });
        }
        true
    }

    fn finish_worker(&self, heap: &Heap, marked: usize) {
        self.marked_bytes.fetch_add(marked, Ordering::SeqCst);
        if self.pending_workers.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        // Last worker out records the cycle's throughput and publishes the
        // finished state.
        let elapsed = self
            .started_at
            .lock()
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let total = self.marked_bytes.load(Ordering::SeqCst);
        heap.mem_controller().lock().record_mark_sample(total, elapsed);
        debug!(marked_bytes = total, ?elapsed, "concurrent mark finished");

        let _guard = self.state_lock.lock();
        self.state.store(FINISHED, Ordering::SeqCst);
        self.finished_cv.notify_all();
    }

    /// Blocks until no pool worker is still tracing.
    pub(crate) fn wait_finished(&self) {
        let mut guard = self.state_lock.lock();
        while self.state.load(Ordering::SeqCst) == MARKING {
            self.finished_cv.wait(&mut guard);
        }
    }

    /// Stop-the-world remark: replays every reference the barrier caught and
    /// rescans the roots, closing the trace over mutations that raced the
    /// background workers. Runs on the caller's thread; the caught set is
    /// small compared to the concurrent bulk.
    pub(crate) fn remark(&self, heap: &Heap) {
        debug_assert_eq!(self.state(), MarkState::Finished);
        let full = self.is_full_mark();
        let work = heap.work();
        while let Some(value) = self.barrier_buffer.pop() {
            seed_value(work, value, full);
        }
        heap.for_each_root(|slot| seed_slot(work, slot, full));

        work.begin_phase(1);
        let mut worker = MarkWorker::new(0, work, None, None);
        worker.process_mark_stack(NonMovableMarker { young_only: !full });
        self.marked_bytes
            .fetch_add(worker.marked_bytes, Ordering::SeqCst);
    }

    /// Retires the cycle's results and turns the barrier back off.
    pub(crate) fn reset(&self) {
        while self.barrier_buffer.pop().is_some() {}
        self.full_mark.store(false, Ordering::SeqCst);
        let _guard = self.state_lock.lock();
        self.state.store(IDLE, Ordering::SeqCst);
        self.finished_cv.notify_all();
    }
}

#[inline]
fn seed_slot(work: &WorkManager, slot: Address, full: bool) {
    // SAFETY: root and remembered-set slots are mapped, aligned locations.
    let value = unsafe { load_slot(slot) };
    seed_value(work, value, full);
}

#[inline]
fn seed_value(work: &WorkManager, value: Address, full: bool) {
    if value == NULL_ADDRESS {
        return;
    }
    // SAFETY: non-null traced values are object base addresses.
    let region = unsafe { Region::from_object(value) };
    if !full && region.kind() != RegionKind::Young {
        return;
    }
    if region.atomic_mark(value) {
        work.push_shared(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_with_barrier_off() {
        let marker = ConcurrentMarker::new();
        assert_eq!(marker.state(), MarkState::Idle);
        assert!(!marker.is_active());
        // Inactive barrier drops values instead of buffering them.
        marker.push_barrier_value(0x1000);
        assert!(marker.barrier_buffer.pop().is_none());
    }

    #[test]
    fn barrier_buffers_while_active_and_reset_drains() {
        let marker = ConcurrentMarker::new();
        marker.state.store(MARKING, Ordering::SeqCst);
        marker.push_barrier_value(0x1000);
        marker.push_barrier_value(NULL_ADDRESS);
        assert_eq!(marker.barrier_buffer.len(), 1);

        marker.state.store(FINISHED, Ordering::SeqCst);
        assert!(marker.is_active());
        marker.push_barrier_value(0x2000);

        marker.reset();
        assert_eq!(marker.state(), MarkState::Idle);
        assert!(marker.barrier_buffer.pop().is_none());
    }
}
