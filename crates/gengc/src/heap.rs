//! The heap: spaces, collection cycles and the embedder-facing surface.
//!
//! One [`Heap`] owns every space, the GC worker pool and the background
//! marking/sweeping machinery. The embedder allocates through the typed
//! `allocate_*` entry points, writes reference fields through
//! [`Heap::write_field`] so the generational and concurrent-marking barriers
//! see every mutation, and registers root slots with [`Heap::add_root`].
//!
//! Collections are stop-the-world with respect to the mutator: the embedder
//! must guarantee no thread touches heap objects while `collect_garbage`
//! runs (allocation from other threads included). Concurrent marking and
//! sweeping, by contrast, are designed to overlap the running mutator and
//! need no such guarantee.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::concurrent_marker::{ConcurrentMarker, MarkState};
use crate::config::{HeapConfig, MIN_OLD_SPACE_SIZE};
use crate::error::AllocError;
use crate::mark::{CompressMarker, MarkWorker, Marker, SemiMarker};
use crate::mem_controller::{MemController, calculate_alloc_limit, calculate_growing_factor};
use crate::object::{
    Address, HEADER_SIZE, MarkWord, MarkWordValue, NULL_ADDRESS, SLOT_SIZE, TypeDescriptor,
    load_slot, store_slot,
};
use crate::region::{Region, RegionKind};
use crate::space::{HugeSpace, LinearSpace, SemiSpace, SparseSpace};
use crate::sweeper::{RegionPtr, SweepTarget, Sweeper};
use crate::taskpool::TaskPool;
use crate::verification;
use crate::work::{EvacTarget, LocalBuffer, WorkManager};

/// Objects above this size bypass the regular spaces and get a dedicated
/// huge region each.
pub const MAX_REGULAR_OBJECT_SIZE: usize = 32 * 1024;

/// Allocation volume between background-trigger polls on the fast path.
const TRIGGER_POLL_STEP: usize = crate::region::REGION_SIZE;

/// Which collection cycle to run. The heap may upgrade a request: an `Old`
/// request without a finished concurrent full trace to consume becomes a
/// stop-the-world `Full` compaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcType {
    /// Evacuate the young generation; promote second-cycle survivors.
    Young,
    /// Young evacuation plus a lazy sweep of the mark-in-place spaces,
    /// consuming a finished concurrent full mark.
    Old,
    /// Stop-the-world compaction of the young and old generations.
    Full,
}

/// Memory growth posture, set by the embedder in response to system-level
/// pressure signals. Tightens the upper clamp of the growing factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemGrowingType {
    /// Grow freely up to the configured maximum factor.
    HighThroughput,
    /// Cap growth at 2x per recomputation.
    Conservative,
    /// Grow by the minimum factor only.
    Pressure,
}

/// Cumulative collection statistics.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub total_gc_count: usize,
    pub young_gc_count: usize,
    pub old_gc_count: usize,
    pub full_gc_count: usize,
    /// Bytes copied out of collect sets, promotions included.
    pub evacuated_bytes: usize,
    /// Bytes promoted into the old generation.
    pub promoted_bytes: usize,
    /// Bytes of huge regions unmapped.
    pub huge_freed_bytes: usize,
    pub last_pause: Duration,
    pub total_pause: Duration,
    pub last_survival_rate: f64,
}

/// Which destination buffers a trace's workers carry.
#[derive(Clone, Copy)]
enum BufferPlan {
    /// Young collection: survivors to the inactive half, promotions to old.
    YoungEvacuation,
    /// Full compaction: everything into the compress space.
    FullCompaction,
}

struct TraceStats {
    evacuated: usize,
    promoted: usize,
}

pub struct Heap {
    config: HeapConfig,
    young: SemiSpace,
    old: SparseSpace,
    /// Compaction destination; populated only inside a full collection, then
    /// exchanged wholesale with the old space.
    compress: SparseSpace,
    non_movable: SparseSpace,
    machine_code: SparseSpace,
    read_only: LinearSpace,
    app_spawn: LinearSpace,
    huge: HugeSpace,
    work: WorkManager,
    pool: TaskPool,
    concurrent_marker: ConcurrentMarker,
    sweeper: Sweeper,
    mem_controller: Mutex<MemController>,
    roots: Mutex<Vec<Address>>,
    weak_callback: Mutex<Option<Box<dyn FnMut(&[Address]) + Send>>>,
    /// Serializes collection cycles.
    gc_lock: Mutex<()>,
    in_gc: AtomicBool,
    full_mark_requested: AtomicBool,
    allocated_since_gc: AtomicUsize,
    /// `allocated_since_gc` value at the last fast-path trigger poll.
    last_trigger_poll: AtomicUsize,
    /// Oversized immortal allocations living in huge regions; seeded into
    /// every full trace so no sweep reclaims them.
    immortal_huge: Mutex<Vec<Address>>,
    growing_type: Mutex<MemGrowingType>,
    stats: Mutex<GcStats>,
}

impl Heap {
    /// Builds a heap from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated bound when the configuration cannot host a
    /// working heap.
    pub fn new(config: HeapConfig) -> Result<Arc<Self>, crate::error::ConfigError> {
        config.validate()?;
        let workers = config.resolved_gc_thread_num();
        let old_max =
            config.max_heap_size - config.fixed_spaces_size() - 2 * config.max_semi_space_size;
        let initial_old_limit =
            (MIN_OLD_SPACE_SIZE + config.min_semi_space_size).min(old_max);

        info!(
            max_heap = config.max_heap_size,
            old_max,
            workers,
            concurrent_mark = config.enable_concurrent_mark,
            concurrent_sweep = config.enable_concurrent_sweep,
            "heap created"
        );

        Ok(Arc::new(Self {
            young: SemiSpace::new(config.min_semi_space_size),
            old: SparseSpace::new(RegionKind::Old, "old", initial_old_limit, old_max),
            compress: SparseSpace::new(RegionKind::Old, "compress", old_max, old_max),
            non_movable: SparseSpace::new(
                RegionKind::NonMovable,
                "non-movable",
                config.non_movable_space_size,
                config.non_movable_space_size,
            ),
            machine_code: SparseSpace::new(
                RegionKind::MachineCode,
                "machine-code",
                config.machine_code_space_size,
                config.machine_code_space_size,
            ),
            read_only: LinearSpace::new(
                RegionKind::ReadOnly,
                "read-only",
                config.read_only_space_size,
            ),
            app_spawn: LinearSpace::new(
                RegionKind::AppSpawn,
                "app-spawn",
                config.app_spawn_space_size,
            ),
            huge: HugeSpace::new(old_max),
            work: WorkManager::new(workers),
            pool: TaskPool::new(workers),
            concurrent_marker: ConcurrentMarker::new(),
            sweeper: Sweeper::new(),
            mem_controller: Mutex::new(MemController::new(config.survival_rate_window)),
            roots: Mutex::new(Vec::new()),
            weak_callback: Mutex::new(None),
            gc_lock: Mutex::new(()),
            in_gc: AtomicBool::new(false),
            full_mark_requested: AtomicBool::new(false),
            allocated_since_gc: AtomicUsize::new(0),
            last_trigger_poll: AtomicUsize::new(0),
            immortal_huge: Mutex::new(Vec::new()),
            growing_type: Mutex::new(MemGrowingType::HighThroughput),
            stats: Mutex::new(GcStats::default()),
            config,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ---- allocation ----

    /// Allocates a young-generation object. Oversized requests route to the
    /// huge space automatically.
    ///
    /// # Errors
    ///
    /// Out of memory after a young and a full collection both failed to make
    /// room.
    pub fn allocate_young(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Result<Address, AllocError> {
        self.poll_allocation_triggers();
        let size = descriptor.size;
        debug_assert_eq!(size % SLOT_SIZE, 0);
        if size > MAX_REGULAR_OBJECT_SIZE {
            return self.allocate_huge(descriptor);
        }
        if let Some(addr) = self.young.allocate_sync(size) {
            return Ok(self.finish_allocation(addr, descriptor, false));
        }
        self.collect_garbage(GcType::Young);
        if let Some(addr) = self.young.allocate_sync(size) {
            return Ok(self.finish_allocation(addr, descriptor, false));
        }
        self.collect_garbage(GcType::Full);
        if let Some(addr) = self.young.allocate_sync(size) {
            return Ok(self.finish_allocation(addr, descriptor, false));
        }
        Err(AllocError::OutOfMemory {
            space: "young",
            size,
        })
    }

    /// Allocates directly in the old generation (objects known long-lived).
    ///
    /// # Errors
    ///
    /// Out of memory after a collection and the one-shot overshoot allowance
    /// both failed to make room.
    pub fn allocate_old(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Result<Address, AllocError> {
        self.poll_allocation_triggers();
        let size = descriptor.size;
        debug_assert_eq!(size % SLOT_SIZE, 0);
        if size > MAX_REGULAR_OBJECT_SIZE {
            return self.allocate_huge(descriptor);
        }
        if let Some(addr) = self.try_allocate_sparse(&self.old, size) {
            return Ok(self.finish_allocation(addr, descriptor, true));
        }
        self.collect_garbage(GcType::Old);
        if let Some(addr) = self.try_allocate_sparse(&self.old, size) {
            return Ok(self.finish_allocation(addr, descriptor, true));
        }
        // Last resort: a bounded allowance above the soft limit, paid back
        // when limits are recomputed after the next full trace.
        self.old
            .increase_out_of_memory_overshoot(self.config.out_of_memory_overshoot_size);
        if let Some(addr) = self.try_allocate_sparse(&self.old, size) {
            return Ok(self.finish_allocation(addr, descriptor, true));
        }
        Err(AllocError::OutOfMemory { space: "old", size })
    }

    /// Allocates an object with a dedicated region.
    ///
    /// # Errors
    ///
    /// Out of memory when the huge space cannot map the object even after a
    /// full collection.
    pub fn allocate_huge(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Result<Address, AllocError> {
        let size = descriptor.size;
        let fresh = self.concurrent_marker.is_active();
        if let Some(addr) = self.huge.allocate(size, fresh) {
            return Ok(self.finish_allocation(addr, descriptor, false));
        }
        self.collect_garbage(GcType::Full);
        if let Some(addr) = self
            .huge
            .allocate(size, self.concurrent_marker.is_active())
        {
            return Ok(self.finish_allocation(addr, descriptor, false));
        }
        Err(AllocError::OutOfMemory {
            space: "huge",
            size,
        })
    }

    /// Allocates a non-movable object (pinned runtime structures). Oversized
    /// requests fall back to the huge space, which never moves objects
    /// either. Exhaustion of this space is fatal.
    pub fn allocate_non_movable(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        self.allocate_structural(&self.non_movable, descriptor)
    }

    /// Allocates in the machine-code space, or the huge space for oversized
    /// requests. Exhaustion is fatal.
    pub fn allocate_machine_code(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        self.allocate_structural(&self.machine_code, descriptor)
    }

    fn allocate_structural(
        self: &Arc<Self>,
        space: &SparseSpace,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        let size = descriptor.size;
        if size > MAX_REGULAR_OBJECT_SIZE {
            return self.allocate_huge_fixed(space.name(), descriptor, false);
        }
        if let Some(addr) = self.try_allocate_sparse(space, size) {
            return self.finish_allocation(addr, descriptor, true);
        }
        self.collect_garbage(GcType::Full);
        if let Some(addr) = self.try_allocate_sparse(space, size) {
            return self.finish_allocation(addr, descriptor, true);
        }
        error!(space = space.name(), size, "structural space exhausted");
        panic!("out of memory in the {} space", space.name());
    }

    /// Allocates an immortal read-only object, or a dedicated huge region
    /// for oversized requests. Exhaustion is fatal.
    pub fn allocate_read_only(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        self.allocate_immortal(&self.read_only, descriptor)
    }

    /// Allocates an immortal app-spawn object, or a dedicated huge region
    /// for oversized requests. Exhaustion is fatal.
    pub fn allocate_app_spawn(
        self: &Arc<Self>,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        self.allocate_immortal(&self.app_spawn, descriptor)
    }

    fn allocate_immortal(
        self: &Arc<Self>,
        space: &LinearSpace,
        descriptor: &'static TypeDescriptor,
    ) -> Address {
        if descriptor.size > MAX_REGULAR_OBJECT_SIZE {
            return self.allocate_huge_fixed(space.name(), descriptor, true);
        }
        match space.allocate_sync(descriptor.size) {
            Some(addr) => self.finish_allocation(addr, descriptor, false),
            None => {
                error!(
                    space = space.name(),
                    size = descriptor.size,
                    "immortal space exhausted"
                );
                panic!("out of memory in the {} space", space.name());
            }
        }
    }

    /// Oversized requests for the fixed spaces land in a huge region, which
    /// never moves, so the pinning contract holds. Immortal requests are
    /// remembered so every trace seeds them.
    fn allocate_huge_fixed(
        self: &Arc<Self>,
        space: &str,
        descriptor: &'static TypeDescriptor,
        immortal: bool,
    ) -> Address {
        match self.allocate_huge(descriptor) {
            Ok(addr) => {
                if immortal {
                    self.immortal_huge.lock().push(addr);
                }
                addr
            }
            Err(err) => {
                error!(space, size = descriptor.size, %err, "oversized allocation failed");
                panic!("out of memory in the {space} space");
            }
        }
    }

    fn try_allocate_sparse(&self, space: &SparseSpace, size: usize) -> Option<Address> {
        space.allocate(size, self.concurrent_marker.is_active())
    }

    fn finish_allocation(
        &self,
        addr: Address,
        descriptor: &'static TypeDescriptor,
        zero: bool,
    ) -> Address {
        if zero && descriptor.size > HEADER_SIZE {
            // Free-list memory may hold stale bytes; markers must never read
            // a garbage slot out of a half-initialized object.
            // SAFETY: [addr, addr + size) was handed out by a space.
            unsafe {
                std::ptr::write_bytes(
                    (addr + HEADER_SIZE) as *mut u8,
                    0,
                    descriptor.size - HEADER_SIZE,
                );
            }
        }
        // SAFETY: `addr` is a fresh allocation of `descriptor.size` bytes.
        unsafe { MarkWord::of(addr) }.install(descriptor);
        self.allocated_since_gc
            .fetch_add(descriptor.size, Ordering::Relaxed);
        if self.concurrent_marker.is_active() {
            // Allocate-black: the trace's snapshot predates this object.
            // SAFETY: the allocation came from a live region.
            let region = unsafe { Region::from_object(addr) };
            region.atomic_mark(addr);
        }
        addr
    }

    // ---- mutation ----

    /// Writes a reference field, running the generational and (when a trace
    /// is live) concurrent-marking write barriers. Every reference store
    /// into a heap object must go through here.
    pub fn write_field(&self, host: Address, slot: Address, value: Address) {
        debug_assert_ne!(host, NULL_ADDRESS);
        if self.concurrent_marker.is_active() {
            // SAFETY: `slot` is a field of the live object `host`.
            let previous = unsafe { load_slot(slot) };
            self.concurrent_marker.push_barrier_value(previous);
        }
        // SAFETY: as above.
        unsafe { store_slot(slot, value) };
        if value == NULL_ADDRESS {
            return;
        }
        // SAFETY: `host` and `value` are object base addresses.
        let host_region = unsafe { Region::from_object(host) };
        if host_region.kind() == RegionKind::Young {
            return;
        }
        let value_region = unsafe { Region::from_object(value) };
        if value_region.kind() == RegionKind::Young {
            if host_region.is_sweeping() {
                // The sweeper owns this region's old-to-new bits right now.
                host_region.insert_sweeping_rset(slot);
            } else {
                host_region.insert_old_to_new_rset(slot);
            }
        }
    }

    /// Writes a root slot, keeping the concurrent-marking barrier informed.
    pub fn write_root(&self, slot: Address, value: Address) {
        if self.concurrent_marker.is_active() {
            // SAFETY: root slots are mapped, aligned locations registered by
            // the embedder.
            let previous = unsafe { load_slot(slot) };
            self.concurrent_marker.push_barrier_value(previous);
        }
        // SAFETY: as above.
        unsafe { store_slot(slot, value) };
    }

    /// Reads a reference field.
    #[must_use]
    pub fn read_field(&self, slot: Address) -> Address {
        // SAFETY: the embedder only passes slots of live objects.
        unsafe { load_slot(slot) }
    }

    /// Registers a root slot: an off-heap location holding a reference that
    /// keeps its referent alive. The collector may rewrite it on evacuation.
    pub fn add_root(&self, slot: Address) {
        self.roots.lock().push(slot);
    }

    /// Unregisters a root slot.
    pub fn remove_root(&self, slot: Address) {
        if self.concurrent_marker.is_active() {
            // Removing a root deletes an edge the snapshot may rely on.
            // SAFETY: the slot was registered and is still mapped.
            let value = unsafe { load_slot(slot) };
            self.concurrent_marker.push_barrier_value(value);
        }
        self.roots.lock().retain(|&s| s != slot);
    }

    /// Installs the callback invoked with the addresses of objects whose
    /// weak referents were cleared, once per collection cycle.
    ///
    /// Clearing is precise for referents inside the collect set. A weak slot
    /// whose holder is reached only through an old-to-new remembered set is
    /// treated as strong for that young cycle; such referents are cleared by
    /// the next old or full collection instead.
    pub fn set_weak_callback(&self, callback: impl FnMut(&[Address]) + Send + 'static) {
        *self.weak_callback.lock() = Some(Box::new(callback));
    }

    // ---- collection ----

    /// Runs one collection cycle. The request may be upgraded, never
    /// downgraded; see [`GcType`].
    pub fn collect_garbage(self: &Arc<Self>, requested: GcType) {
        let _guard = self.gc_lock.lock();
        self.in_gc.store(true, Ordering::SeqCst);
        self.mem_controller
            .lock()
            .start_calculation_before_gc(self.allocated_since_gc.swap(0, Ordering::AcqRel));

        // Regions must not change hands while a sweep rebuilds free lists,
        // and no object may move while a background trace reads headers.
        self.sweeper.ensure_all_tasks_finished();
        self.concurrent_marker.wait_finished();
        // A barrier insert can land in a sweeping set just after the sweep's
        // own merge; fold any such stragglers back before seeding.
        self.for_each_old_generation_region(Region::merge_sweeping_rset);

        let gc_type = self.select_gc_type(requested);
        debug!(?requested, ?gc_type, "collection started");
        if self.config.enable_heap_verify {
            self.verify("pre-gc");
        }

        match gc_type {
            GcType::Young => self.young_collection(),
            GcType::Old => self.old_collection(),
            GcType::Full => self.full_collection(),
        }

        if matches!(gc_type, GcType::Old | GcType::Full) {
            self.recompute_limits();
        }

        let pause = self.mem_controller.lock().stop_calculation_after_gc();
        {
            let mut stats = self.stats.lock();
            stats.total_gc_count += 1;
            match gc_type {
                GcType::Young => stats.young_gc_count += 1,
                GcType::Old => stats.old_gc_count += 1,
                GcType::Full => stats.full_gc_count += 1,
            }
            stats.last_pause = pause;
            stats.total_pause += pause;
        }
        info!(?gc_type, ?pause, committed = self.committed(), "collection finished");

        if self.config.enable_heap_verify {
            self.verify("post-gc");
        }
        if gc_type == GcType::Full {
            // Compaction bookkeeping served its verification purpose.
            self.for_each_old_generation_region(Region::clear_cross_region_rset);
        }
        self.in_gc.store(false, Ordering::SeqCst);

        if self.full_mark_requested.load(Ordering::SeqCst) {
            self.try_trigger_concurrent_marking();
        }
    }

    fn select_gc_type(&self, requested: GcType) -> GcType {
        if requested == GcType::Full {
            return GcType::Full;
        }
        if self.concurrent_marker.state() == MarkState::Finished
            && self.concurrent_marker.is_full_mark()
        {
            return GcType::Old;
        }
        if requested == GcType::Old {
            // No finished full trace to consume; compaction reclaims the old
            // generation without one.
            return GcType::Full;
        }
        // A survival-driven full-mark request with no background marker to
        // serve it compacts instead.
        if !self.config.enable_concurrent_mark
            && self.full_mark_requested.load(Ordering::SeqCst)
        {
            return GcType::Full;
        }
        // Exhausted limits make another young cycle pointless.
        if self.old.used() >= self.old.limit() || self.used() >= self.config.max_heap_size {
            return GcType::Full;
        }
        GcType::Young
    }

    fn young_collection(self: &Arc<Self>) {
        self.evacuate_young(GcType::Young);
        if self.concurrent_marker.state() == MarkState::Finished
            && !self.concurrent_marker.is_full_mark()
        {
            // Young-bounded mark bits died with the from-space.
            self.concurrent_marker.reset();
        }
    }

    /// Evacuates the young generation: collect set is the active half, roots
    /// are the registered slots plus every old-to-new remembered slot.
    fn evacuate_young(self: &Arc<Self>, weak_mode: GcType) {
        let from_used = self.young.used();
        self.young
            .active()
            .for_each_region(|region| region.set_in_collect_set(true));

        let trace = self.run_parallel_trace(SemiMarker, BufferPlan::YoungEvacuation, |worker| {
            self.seed_roots(worker, SemiMarker);
            self.seed_remembered_sets(worker, SemiMarker);
        });

        // Weak referents must still be mapped for the liveness check.
        self.process_weak_slots(weak_mode);

        self.young.swap();
        drop(self.young.inactive().take_regions());
        self.young.seal_water_lines();

        let survival = if from_used == 0 {
            0.0
        } else {
            (trace.evacuated as f64 / from_used as f64).min(1.0)
        };
        self.adjust_by_survival_rate(survival);

        let mut stats = self.stats.lock();
        stats.evacuated_bytes += trace.evacuated;
        stats.promoted_bytes += trace.promoted;
        stats.last_survival_rate = survival;
    }

    /// Young evacuation plus a lazy sweep of the mark-in-place spaces,
    /// consuming the finished concurrent full trace.
    fn old_collection(self: &Arc<Self>) {
        debug_assert!(self.concurrent_marker.is_full_mark());
        self.concurrent_marker.remark(self);

        // Snapshot before promotion buffers add regions: everything merged
        // during the evacuation below is implicitly live this cycle.
        let old_snapshot = self.snapshot_for_sweep(&self.old);
        let non_movable_snapshot = self.snapshot_for_sweep(&self.non_movable);
        let machine_code_snapshot = self.snapshot_for_sweep(&self.machine_code);

        self.evacuate_young(GcType::Old);

        let huge_freed = self.huge.sweep();
        self.stats.lock().huge_freed_bytes += huge_freed;
        self.concurrent_marker.reset();

        let concurrent = self.config.enable_concurrent_sweep;
        self.sweeper
            .post(self, SweepTarget::Old, old_snapshot, concurrent);
        self.sweeper
            .post(self, SweepTarget::NonMovable, non_movable_snapshot, concurrent);
        self.sweeper
            .post(self, SweepTarget::MachineCode, machine_code_snapshot, concurrent);
    }

    /// Stop-the-world compaction: the whole young generation and every old
    /// region evacuate into the compress space, which then becomes the old
    /// space.
    fn full_collection(self: &Arc<Self>) {
        // Compaction recomputes liveness globally, satisfying any pending
        // full-mark request.
        self.full_mark_requested.store(false, Ordering::SeqCst);
        if self.concurrent_marker.is_active() {
            // Compaction recomputes liveness from scratch; in-flight results
            // are discarded.
            self.concurrent_marker.reset();
        }
        self.clear_mark_bits(true);
        // After compaction no young objects remain, so every old-to-new
        // entry is stale.
        self.for_each_old_generation_region(Region::clear_old_to_new_rset);

        self.young
            .active()
            .for_each_region(|region| region.set_in_collect_set(true));
        self.old
            .for_each_region(|region| region.set_in_collect_set(true));

        let trace = self.run_parallel_trace(CompressMarker, BufferPlan::FullCompaction, |worker| {
            self.seed_roots(worker, CompressMarker);
            self.seed_immortal_objects(worker);
        });

        self.process_weak_slots(GcType::Full);

        drop(self.young.active().take_regions());
        drop(self.young.inactive().take_regions());
        drop(self.old.take_regions());
        self.old.swap_contents(&self.compress);

        let non_movable_snapshot = self.snapshot_for_sweep(&self.non_movable);
        let machine_code_snapshot = self.snapshot_for_sweep(&self.machine_code);
        let huge_freed = self.huge.sweep();

        let concurrent = self.config.enable_concurrent_sweep;
        self.sweeper
            .post(self, SweepTarget::NonMovable, non_movable_snapshot, concurrent);
        self.sweeper
            .post(self, SweepTarget::MachineCode, machine_code_snapshot, concurrent);

        let mut stats = self.stats.lock();
        stats.evacuated_bytes += trace.evacuated;
        stats.promoted_bytes += trace.promoted;
        stats.huge_freed_bytes += huge_freed;
        drop(stats);

        // Survival rates measured before the compaction no longer describe
        // the surviving population.
        self.mem_controller.lock().reset_recorded_survival_rates();
    }

    /// Flags a space's regions for sweeping and resets its free list; the
    /// sweep rebuilds it from the mark bits.
    fn snapshot_for_sweep(&self, space: &SparseSpace) -> Vec<RegionPtr> {
        let mut snapshot = Vec::new();
        space.for_each_region(|region| {
            region.set_sweeping(true);
            snapshot.push(RegionPtr::new(region));
        });
        space.reset_free_list();
        snapshot
    }

    // ---- tracing ----

    fn run_parallel_trace<M: Marker>(
        self: &Arc<Self>,
        marker: M,
        plan: BufferPlan,
        seed: impl FnOnce(&mut MarkWorker<'_>),
    ) -> TraceStats {
        let workers = if self.config.enable_parallel_gc {
            self.work.worker_count()
        } else {
            1
        };
        self.work.begin_phase(workers);

        let mut initiator = self.trace_worker(0, plan);
        seed(&mut initiator);

        let (done_tx, done_rx) = crossbeam::channel::bounded(workers);
        for id in 1..workers {
            let heap = Arc::clone(self);
            let done = done_tx.clone();
            self.pool.post(move || {
                let mut worker = heap.trace_worker(id, plan);
                worker.process_mark_stack(marker);
                worker.merge_buffers();
                let _ = done.send((worker.evacuated_bytes, worker.promoted_bytes));
            });
        }
        drop(done_tx);

        initiator.process_mark_stack(marker);
        initiator.merge_buffers();
        let mut stats = TraceStats {
            evacuated: initiator.evacuated_bytes,
            promoted: initiator.promoted_bytes,
        };
        for _ in 1..workers {
            match done_rx.recv() {
                Ok((evacuated, promoted)) => {
                    stats.evacuated += evacuated;
                    stats.promoted += promoted;
                }
                Err(err) => {
                    // A worker that never reported left the trace incomplete;
                    // continuing would let dangling references survive.
                    error!(%err, "trace worker lost");
                    panic!("GC trace worker failed");
                }
            }
        }
        stats
    }

    fn trace_worker(&self, id: usize, plan: BufferPlan) -> MarkWorker<'_> {
        let (young_buffer, old_buffer) = match plan {
            BufferPlan::YoungEvacuation => (
                Some(LocalBuffer::new(EvacTarget::Linear(self.young.inactive()))),
                Some(LocalBuffer::new(EvacTarget::Sparse(&self.old))),
            ),
            BufferPlan::FullCompaction => {
                (None, Some(LocalBuffer::new(EvacTarget::Sparse(&self.compress))))
            }
        };
        MarkWorker::new(id, &self.work, young_buffer, old_buffer)
    }

    fn seed_roots<M: Marker>(&self, worker: &mut MarkWorker<'_>, marker: M) {
        for &slot in self.roots.lock().iter() {
            marker.visit_slot(worker, NULL_ADDRESS, slot);
        }
    }

    /// Takes each old-generation region's old-to-new set and replays its
    /// slots as roots. The sets are rebuilt by the trace itself: every slot
    /// that still refers to a young object after evacuation is re-recorded.
    fn seed_remembered_sets<M: Marker>(&self, worker: &mut MarkWorker<'_>, marker: M) {
        self.for_each_old_generation_region(|region| {
            if let Some(set) = region.take_old_to_new_rset() {
                // Any in-region address works as the host: it resolves to
                // the region whose kind the barrier bookkeeping needs.
                let host = region.begin();
                set.iterate(|slot| marker.visit_slot(worker, host, slot));
            }
        });
    }

    /// Immortal objects are live by definition but still hold references
    /// that a compacting trace must follow and patch. Oversized immortal
    /// objects live in huge regions whose sweep retains by mark bit, so
    /// seeding re-marks them every cycle.
    fn seed_immortal_objects(&self, worker: &mut MarkWorker<'_>) {
        self.for_each_immortal_object(|object| {
            // SAFETY: immortal objects are base addresses in live regions.
            unsafe { Region::from_object(object) }.atomic_mark(object);
            worker.push(object);
        });
    }

    /// Resolves every weak slot discovered by the cycle's traces: referents
    /// that moved get the forwarding address, dead referents are cleared and
    /// reported through the weak callback.
    fn process_weak_slots(&self, gc_type: GcType) {
        let mut dead = Vec::new();
        while let Some(weak) = self.work.pop_weak() {
            let slot = weak.slot;
            // SAFETY: weak slots come from descriptor enumeration of live
            // objects.
            let value = unsafe { load_slot(slot) };
            if value == NULL_ADDRESS {
                continue;
            }
            // SAFETY: non-null referents are object base addresses.
            let region = unsafe { Region::from_object(value) };
            if region.in_collect_set() {
                match unsafe { MarkWord::of(value).value() } {
                    MarkWordValue::Forwarded(to) => unsafe { store_slot(slot, to) },
                    MarkWordValue::Live(_) => {
                        unsafe { store_slot(slot, NULL_ADDRESS) };
                        dead.push(value);
                    }
                }
            } else if matches!(gc_type, GcType::Old | GcType::Full)
                && !region.kind().is_immortal()
                && region.kind() != RegionKind::Young
                && !region.is_fresh_during_mark()
                && !region.is_marked(value)
            {
                unsafe { store_slot(slot, NULL_ADDRESS) };
                dead.push(value);
            }
        }
        if !dead.is_empty() {
            // Stale queue entries left by an earlier trace can rediscover
            // the same referent through a second slot.
            dead.sort_unstable();
            dead.dedup();
            if let Some(callback) = self.weak_callback.lock().as_mut() {
                callback(&dead);
            }
        }
    }

    // ---- heuristics ----

    fn adjust_by_survival_rate(&self, survival: f64) {
        let average = {
            let mut controller = self.mem_controller.lock();
            controller.add_survival_rate(survival);
            controller.average_survival_rate().unwrap_or(0.0)
        };
        if average > 0.8 {
            // Young collections are churning; liveness must be recomputed
            // across the whole heap.
            self.full_mark_requested.store(true, Ordering::SeqCst);
        }
        let capacity = self.young.capacity();
        let target = if average > 0.5 {
            capacity.saturating_mul(2)
        } else if average < 0.1 {
            capacity / 2
        } else {
            capacity
        };
        self.young.adjust_capacity(
            target,
            self.config.min_semi_space_size,
            self.config.max_semi_space_size,
        );
    }

    /// Recomputes the old-space soft limit from observed throughput and
    /// retires any overshoot allowance.
    fn recompute_limits(&self) {
        let (mark_speed, alloc_speed) = {
            let controller = self.mem_controller.lock();
            (controller.mark_speed(), controller.allocation_speed())
        };
        let factor = calculate_growing_factor(
            mark_speed.unwrap_or(0.0),
            alloc_speed.unwrap_or(0.0),
            self.config.min_growing_factor,
            self.effective_max_growing_factor(),
        );
        let limit = calculate_alloc_limit(
            self.old.used(),
            MIN_OLD_SPACE_SIZE,
            self.old.max_capacity(),
            self.young.capacity(),
            factor,
            self.config.min_growing_step,
        );
        debug!(factor, limit, "old-space limit recomputed");
        self.old.set_limit(limit);
        self.old.reset_overshoot();
    }

    fn effective_max_growing_factor(&self) -> f64 {
        match *self.growing_type.lock() {
            MemGrowingType::HighThroughput => self.config.max_growing_factor,
            MemGrowingType::Conservative => self.config.max_growing_factor.min(2.0),
            MemGrowingType::Pressure => self.config.min_growing_factor,
        }
    }

    /// Rate-limited heuristic check run on the allocation fast path: every
    /// region's worth of new allocation, look for old-generation pressure
    /// and a reason to start background marking.
    fn poll_allocation_triggers(self: &Arc<Self>) {
        if self.in_gc.load(Ordering::SeqCst) {
            return;
        }
        let since = self.allocated_since_gc.load(Ordering::Relaxed);
        let last = self.last_trigger_poll.load(Ordering::Relaxed);
        if since.wrapping_sub(last) < TRIGGER_POLL_STEP {
            return;
        }
        if self
            .last_trigger_poll
            .compare_exchange(last, since, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if !self.check_and_trigger_old_gc() {
            self.try_trigger_concurrent_marking();
        }
    }

    /// Starts a concurrent trace when the heuristics predict the mutator
    /// would otherwise exhaust a generation before a trace could finish.
    /// Returns whether a trace was started.
    pub fn try_trigger_concurrent_marking(self: &Arc<Self>) -> bool {
        if !self.config.enable_concurrent_mark
            || self.in_gc.load(Ordering::SeqCst)
            || self.concurrent_marker.is_active()
        {
            return false;
        }

        let full = self.full_mark_requested.load(Ordering::SeqCst)
            || self.old.used() * 4 >= self.old.limit() * 3;
        if full {
            if self.concurrent_marker.try_start(self, true) {
                self.full_mark_requested.store(false, Ordering::SeqCst);
                return true;
            }
            return false;
        }

        let used = self.young.used();
        let (alloc_speed, mark_speed) = {
            let controller = self.mem_controller.lock();
            (controller.allocation_speed(), controller.mark_speed())
        };
        let should_start = match (alloc_speed, mark_speed) {
            (Some(alloc), Some(mark)) if alloc > 0.0 && mark > 0.0 => {
                let remaining = self.young.capacity().saturating_sub(used);
                // Start when the time to exhaust the young space undercuts
                // the predicted trace time.
                (remaining as f64 / alloc) <= (used as f64 / mark)
            }
            _ => used >= self.config.semi_space_trigger_concurrent_mark,
        };
        should_start && self.concurrent_marker.try_start(self, false)
    }

    /// Checks old-generation pressure; consumes a finished full trace with
    /// an old collection or requests one otherwise. Returns whether any
    /// action was taken.
    pub fn check_and_trigger_old_gc(self: &Arc<Self>) -> bool {
        if self.old.used() * 20 < self.old.limit() * 17 {
            return false;
        }
        if self.concurrent_marker.state() == MarkState::Finished
            && self.concurrent_marker.is_full_mark()
        {
            self.collect_garbage(GcType::Old);
            return true;
        }
        self.full_mark_requested.store(true, Ordering::SeqCst);
        self.try_trigger_concurrent_marking()
    }

    /// Opportunistic work while the embedder is idle: consume a finished
    /// trace, collect a filling young space, or start a background trace.
    pub fn trigger_idle_collection(self: &Arc<Self>) {
        if !self.config.enable_idle_gc || self.in_gc.load(Ordering::SeqCst) {
            return;
        }
        if self.concurrent_marker.state() == MarkState::Finished {
            let gc_type = if self.concurrent_marker.is_full_mark() {
                GcType::Old
            } else {
                GcType::Young
            };
            self.collect_garbage(gc_type);
            return;
        }
        if self.young.used() * 2 >= self.young.capacity() {
            self.collect_garbage(GcType::Young);
            return;
        }
        self.try_trigger_concurrent_marking();
    }

    /// Adjusts the growth posture.
    pub fn change_gc_params(&self, growing_type: MemGrowingType) {
        *self.growing_type.lock() = growing_type;
    }

    /// Reacts to a system memory-pressure signal: tighten growth, and under
    /// critical pressure compact immediately.
    pub fn notify_memory_pressure(self: &Arc<Self>, critical: bool) {
        if critical {
            self.change_gc_params(MemGrowingType::Pressure);
            self.collect_garbage(GcType::Full);
        } else {
            self.change_gc_params(MemGrowingType::Conservative);
        }
    }

    // ---- introspection ----

    #[must_use]
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Whether a background trace is running or holding unconsumed results.
    #[must_use]
    pub fn concurrent_marking_active(&self) -> bool {
        self.concurrent_marker.is_active()
    }

    /// Bytes of mapped memory across all spaces.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.young.committed()
            + self.old.committed()
            + self.compress.committed()
            + self.non_movable.committed()
            + self.machine_code.committed()
            + self.read_only.committed()
            + self.app_spawn.committed()
            + self.huge.committed()
    }

    /// Bytes currently allocated to objects.
    #[must_use]
    pub fn used(&self) -> usize {
        self.young.used()
            + self.old.used()
            + self.non_movable.used()
            + self.machine_code.used()
            + self.read_only.used()
            + self.app_spawn.used()
            + self.huge.committed()
    }

    /// Visits every region of every space.
    pub fn enumerate_regions(&self, mut f: impl FnMut(&Region)) {
        self.young.active().for_each_region(&mut f);
        self.young.inactive().for_each_region(&mut f);
        self.old.for_each_region(&mut f);
        self.non_movable.for_each_region(&mut f);
        self.machine_code.for_each_region(&mut f);
        self.read_only.for_each_region(&mut f);
        self.app_spawn.for_each_region(&mut f);
        self.huge.for_each_region(&mut f);
    }

    /// Visits every live object. Must not run while a collection or a
    /// concurrent sweep is in progress.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(Address)) {
        self.young.active().iterate_objects(&mut f);
        self.old.iterate_objects(&mut f);
        self.non_movable.iterate_objects(&mut f);
        self.machine_code.iterate_objects(&mut f);
        self.read_only.iterate_objects(&mut f);
        self.app_spawn.iterate_objects(&mut f);
        self.huge.iterate_objects(&mut f);
    }

    /// Runs the verification pass and returns the number of failures found.
    /// With `enable_heap_verify` set this also runs around every collection,
    /// where any failure is fatal.
    pub fn verify_heap(&self) -> usize {
        self.sweeper.ensure_all_tasks_finished();
        // Recover barrier inserts that raced a finishing sweep, as the
        // collection prologue does.
        self.for_each_old_generation_region(Region::merge_sweeping_rset);
        verification::verify_heap(self) + verification::verify_old_to_new(self)
    }

    fn verify(&self, phase: &str) {
        self.sweeper.ensure_all_tasks_finished();
        let failures = verification::verify_heap(self) + verification::verify_old_to_new(self);
        if failures > 0 {
            error!(phase, failures, "heap verification failed");
            panic!("heap verification failed ({failures} failures)");
        }
    }

    // ---- crate-internal plumbing ----

    pub(crate) fn work(&self) -> &WorkManager {
        &self.work
    }

    pub(crate) fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub(crate) fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub(crate) fn concurrent_marker(&self) -> &ConcurrentMarker {
        &self.concurrent_marker
    }

    pub(crate) fn mem_controller(&self) -> &Mutex<MemController> {
        &self.mem_controller
    }

    pub(crate) fn sweep_space(&self, target: SweepTarget) -> &SparseSpace {
        match target {
            SweepTarget::Old => &self.old,
            SweepTarget::NonMovable => &self.non_movable,
            SweepTarget::MachineCode => &self.machine_code,
        }
    }

    pub(crate) fn for_each_root(&self, mut f: impl FnMut(Address)) {
        for &slot in self.roots.lock().iter() {
            f(slot);
        }
    }

    pub(crate) fn for_each_immortal_object(&self, mut f: impl FnMut(Address)) {
        self.read_only.iterate_objects(&mut f);
        self.app_spawn.iterate_objects(&mut f);
        for &object in self.immortal_huge.lock().iter() {
            f(object);
        }
    }

    pub(crate) fn for_each_old_generation_region(&self, mut f: impl FnMut(&Region)) {
        self.old.for_each_region(&mut f);
        self.non_movable.for_each_region(&mut f);
        self.machine_code.for_each_region(&mut f);
        self.read_only.for_each_region(&mut f);
        self.app_spawn.for_each_region(&mut f);
        self.huge.for_each_region(&mut f);
    }

    pub(crate) fn clear_mark_bits(&self, include_old_generation: bool) {
        self.young
            .active()
            .for_each_region(Region::clear_mark_bits);
        self.young
            .inactive()
            .for_each_region(Region::clear_mark_bits);
        if include_old_generation {
            self.old.clear_mark_bits();
            self.non_movable.clear_mark_bits();
            self.machine_code.clear_mark_bits();
            self.huge.clear_mark_bits();
            self.read_only.for_each_region(Region::clear_mark_bits);
            self.app_spawn.for_each_region(Region::clear_mark_bits);
        }
    }
}
