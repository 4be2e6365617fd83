//! Per-worker work queues, the shared overflow pool and worker-local
//! allocation buffers for parallel marking and evacuation.

pub mod steal_queue;

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::Address;
use crate::region::Region;
use crate::space::{LinearSpace, SparseSpace};
use steal_queue::StealQueue;

/// Capacity of one worker's deque; overflow spills to the shared pool.
const QUEUE_CAPACITY: usize = 2048;

/// A weak reference slot discovered during tracing, processed after the
/// reachable set is complete.
#[derive(Clone, Copy)]
pub struct WeakSlot {
    pub slot: Address,
}

/// Shared state of one marking/evacuation phase: per-worker gray-object
/// deques, the global overflow pool, discovered weak slots and the
/// termination counter.
pub struct WorkManager {
    queues: Box<[StealQueue<Address, QUEUE_CAPACITY>]>,
    overflow: SegQueue<Address>,
    weak_slots: SegQueue<WeakSlot>,
    /// Number of workers still holding or looking for work; the phase ends
    /// when it reaches zero with every queue drained.
    active: AtomicUsize,
}

impl WorkManager {
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            queues: (0..worker_count).map(|_| StealQueue::new()).collect(),
            overflow: SegQueue::new(),
            weak_slots: SegQueue::new(),
            active: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Arms the termination counter for `workers` participants.
    pub fn begin_phase(&self, workers: usize) {
        debug_assert!(workers <= self.queues.len());
        self.active.store(workers, Ordering::SeqCst);
    }

    /// Pushes a gray object on behalf of worker `id`.
    #[inline]
    pub fn push(&self, id: usize, object: Address) {
        if !self.queues[id].push(object) {
            self.overflow.push(object);
        }
    }

    /// Pushes into the shared pool directly (used by root seeding outside a
    /// worker context, e.g. the concurrent marker's safepoint scan).
    #[inline]
    pub fn push_shared(&self, object: Address) {
        self.overflow.push(object);
    }

    /// Takes the next unit of work for worker `id`: own queue first, then
    /// the overflow pool, then stealing from the other workers.
    pub fn take(&self, id: usize) -> Option<Address> {
        if let Some(object) = self.queues[id].pop() {
            return Some(object);
        }
        if let Some(object) = self.overflow.pop() {
            return Some(object);
        }
        let n = self.queues.len();
        for offset in 1..n {
            let victim = (id + offset) % n;
            if let Some(object) = self.queues[victim].steal() {
                return Some(object);
            }
        }
        None
    }

    pub fn push_weak(&self, slot: WeakSlot) {
        self.weak_slots.push(slot);
    }

    pub fn pop_weak(&self) -> Option<WeakSlot> {
        self.weak_slots.pop()
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.overflow.is_empty() || self.queues.iter().any(|q| !q.is_empty())
    }

    /// Termination detection. A worker whose queue ran dry calls this; the
    /// return value is `true` when the whole phase is finished. On `false`
    /// the worker is re-armed and must resume draining.
    pub fn try_terminate(&self, _id: usize) -> bool {
        self.active.fetch_sub(1, Ordering::SeqCst);
        loop {
            if self.has_work() {
                self.active.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// Which space a local buffer refills from.
pub enum EvacTarget<'h> {
    Linear(&'h LinearSpace),
    Sparse(&'h SparseSpace),
}

/// Worker-private bump allocator into a destination space.
///
/// Each evacuation worker owns one buffer per destination so no two threads
/// contend on a shared allocation pointer. Regions are taken whole from the
/// target space and published back in [`LocalBuffer::merge`] at phase end.
pub struct LocalBuffer<'h> {
    target: EvacTarget<'h>,
    regions: Vec<Box<Region>>,
    top: Address,
    end: Address,
    allocated: usize,
}

impl<'h> LocalBuffer<'h> {
    #[must_use]
    pub fn new(target: EvacTarget<'h>) -> Self {
        Self {
            target,
            regions: Vec::new(),
            top: 0,
            end: 0,
            allocated: 0,
        }
    }

    /// Bump-allocates `size` bytes. No synchronization: the buffer is
    /// private to its worker until merged.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if self.top + size <= self.end {
            let addr = self.top;
            self.top += size;
            self.allocated += size;
            return Some(addr);
        }
        self.seal_current();
        let region = match &self.target {
            EvacTarget::Linear(space) => space.take_buffer_region()?,
            EvacTarget::Sparse(space) => space.take_buffer_region()?,
        };
        self.top = region.begin();
        self.end = region.end();
        self.regions.push(region);
        if self.top + size <= self.end {
            let addr = self.top;
            self.top += size;
            self.allocated += size;
            Some(addr)
        } else {
            None
        }
    }

    /// Rolls back the most recent allocation after losing a forwarding CAS,
    /// so racing evacuators never leak a duplicate copy.
    pub fn undo(&mut self, addr: Address, size: usize) {
        if addr + size == self.top {
            self.top = addr;
            self.allocated -= size;
        }
    }

    fn seal_current(&mut self) {
        if let Some(region) = self.regions.last() {
            region.set_top(self.top);
        }
    }

    /// Bytes handed out by this buffer.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Publishes every buffer region into the target space.
    pub fn merge(mut self) {
        self.seal_current();
        for region in self.regions.drain(..) {
            match &self.target {
                EvacTarget::Linear(space) => space.merge_region(region),
                EvacTarget::Sparse(space) => space.merge_buffer_region(region),
            }
        }
    }
}
