//! Free-list spaces.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::free_list::FreeList;
use crate::object::Address;
use crate::region::{REGION_SIZE, Region, RegionKind};

/// A free-list space. Allocation walks segregated free lists under a plain
/// lock; GC workers never contend here because evacuation goes through
/// worker-local buffers that take whole regions instead.
pub struct SparseSpace {
    kind: RegionKind,
    name: &'static str,
    regions: Mutex<Vec<Box<Region>>>,
    free_list: Mutex<FreeList>,
    committed: AtomicUsize,
    /// Soft expansion limit; raised by limit recomputation, temporarily
    /// exceeded by the out-of-memory overshoot allowance.
    limit: AtomicUsize,
    /// Hard bound, never exceeded.
    max_capacity: usize,
    overshoot: AtomicUsize,
}

impl SparseSpace {
    #[must_use]
    pub fn new(kind: RegionKind, name: &'static str, limit: usize, max_capacity: usize) -> Self {
        Self {
            kind,
            name,
            regions: Mutex::new(Vec::new()),
            free_list: Mutex::new(FreeList::new()),
            committed: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            max_capacity,
            overshoot: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Free-list allocation; expands by one region when the lists are empty
    /// and the soft limit (plus any overshoot allowance) permits. Failure is
    /// reported to the heap, which decides between GC, overshoot and OOM.
    pub fn allocate(&self, size: usize, fresh_during_mark: bool) -> Option<Address> {
        if let Some(addr) = self.free_list.lock().allocate(size) {
            return Some(addr);
        }

        let mut regions = self.regions.lock();
        let budget = self.limit.load(Ordering::Acquire) + self.overshoot.load(Ordering::Acquire);
        if self.committed.load(Ordering::Acquire) + REGION_SIZE > budget.min(self.max_capacity) {
            return None;
        }
        let region = Region::new(self.kind);
        self.committed.fetch_add(REGION_SIZE, Ordering::AcqRel);
        region.set_top(region.end());
        if fresh_during_mark {
            region.set_fresh_during_mark(true);
        }
        let (begin, end) = (region.begin(), region.end());
        regions.push(region);
        drop(regions);

        let mut list = self.free_list.lock();
        // SAFETY: the whole payload of a freshly mapped region is free.
        unsafe { list.free(begin, end - begin) };
        list.allocate(size)
    }

    /// Hands out a fresh region for a worker-local evacuation buffer. Only
    /// the hard capacity bounds this: survivors being copied cannot exceed
    /// what was already live, and limits are recomputed after the cycle.
    pub fn take_buffer_region(&self) -> Option<Box<Region>> {
        if self.committed.load(Ordering::Acquire) + REGION_SIZE > self.max_capacity {
            return None;
        }
        self.committed.fetch_add(REGION_SIZE, Ordering::AcqRel);
        Some(Region::new(self.kind))
    }

    /// Publishes a merged buffer region; the unused tail joins the free list.
    pub fn merge_buffer_region(&self, region: Box<Region>) {
        let top = region.top();
        let end = region.end();
        {
            let mut list = self.free_list.lock();
            // SAFETY: the tail above the buffer's final top was never handed out.
            unsafe { list.free(top, end - top) };
        }
        region.set_top(end);
        self.regions.lock().push(region);
    }

    /// Returns reclaimed spans from the sweeper in one batch.
    pub fn merge_free_spans(&self, spans: &[(Address, usize)]) {
        let mut list = self.free_list.lock();
        for &(start, len) in spans {
            // SAFETY: the sweeper only reports spans of dead objects.
            unsafe { list.free(start, len) };
        }
    }

    /// Drops all free-list bookkeeping before a sweep rebuilds it.
    pub fn reset_free_list(&self) {
        self.free_list.lock().reset();
    }

    /// Removes and returns every region, resetting the space to empty.
    pub fn take_regions(&self) -> Vec<Box<Region>> {
        let mut regions = self.regions.lock();
        self.free_list.lock().reset();
        self.committed.store(0, Ordering::Release);
        std::mem::take(&mut *regions)
    }

    /// Exchanges the entire contents of two sparse spaces (old/compress swap
    /// after a full compaction). Both spaces must be quiescent.
    pub fn swap_contents(&self, other: &Self) {
        debug_assert!(!std::ptr::eq(self, other));
        let mut my_regions = self.regions.lock();
        let mut their_regions = other.regions.lock();
        std::mem::swap(&mut *my_regions, &mut *their_regions);

        let mut my_list = self.free_list.lock();
        let mut their_list = other.free_list.lock();
        std::mem::swap(&mut *my_list, &mut *their_list);

        let mine = self.committed.load(Ordering::Acquire);
        let theirs = other.committed.load(Ordering::Acquire);
        self.committed.store(theirs, Ordering::Release);
        other.committed.store(mine, Ordering::Release);
    }

    pub fn for_each_region(&self, mut f: impl FnMut(&Region)) {
        for region in self.regions.lock().iter() {
            f(region);
        }
    }

    pub fn clear_mark_bits(&self) {
        self.for_each_region(Region::clear_mark_bits);
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes in use (committed minus free-list availability).
    #[must_use]
    pub fn used(&self) -> usize {
        self.committed() - self.free_list.lock().available()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit
            .store(limit.min(self.max_capacity), Ordering::Release);
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Grants a temporary allowance above the soft limit so an allocation
    /// that failed even after a collection can still finish.
    pub fn increase_out_of_memory_overshoot(&self, bytes: usize) {
        self.overshoot.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn reset_overshoot(&self) {
        self.overshoot.store(0, Ordering::Release);
    }

    /// Walks every object and free span linearly.
    pub fn iterate_objects(&self, mut f: impl FnMut(Address)) {
        self.for_each_region(|region| {
            let mut addr = region.begin();
            let top = region.top();
            while addr < top {
                // SAFETY: sparse regions are fully walkable: live objects and
                // free spans both carry installed headers.
                let size = unsafe { crate::object::size_of_object(addr) };
                let is_free = match unsafe { crate::object::MarkWord::of(addr).value() } {
                    crate::object::MarkWordValue::Live(desc) => desc.is_free(),
                    crate::object::MarkWordValue::Forwarded(_) => false,
                };
                if !is_free {
                    f(addr);
                }
                addr += size;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(limit_regions: usize) -> SparseSpace {
        SparseSpace::new(
            RegionKind::Old,
            "old",
            limit_regions * REGION_SIZE,
            8 * REGION_SIZE,
        )
    }

    #[test]
    fn allocate_expands_then_reuses_free_list() {
        let s = space(2);
        let a = s.allocate(64, false).unwrap();
        let b = s.allocate(64, false).unwrap();
        assert_ne!(a, b);
        assert_eq!(s.committed(), REGION_SIZE);
    }

    #[test]
    fn soft_limit_blocks_expansion_until_overshoot() {
        let s = space(1);
        assert!(s.allocate(64, false).is_some());
        // Exhaust the region.
        while s.allocate(32 * 1024, false).is_some() {}
        let big = 64 * 1024;
        assert!(s.allocate(big, false).is_none());
        s.increase_out_of_memory_overshoot(REGION_SIZE);
        assert!(s.allocate(big, false).is_some());
        assert_eq!(s.committed(), 2 * REGION_SIZE);
    }

    #[test]
    fn swap_contents_exchanges_everything() {
        let a = space(4);
        let b = space(4);
        a.allocate(64, false).unwrap();
        assert_eq!(a.committed(), REGION_SIZE);
        assert_eq!(b.committed(), 0);
        a.swap_contents(&b);
        assert_eq!(a.committed(), 0);
        assert_eq!(b.committed(), REGION_SIZE);
        // The free list moved with the regions.
        assert!(b.allocate(64, false).is_some());
        assert_eq!(b.committed(), REGION_SIZE);
    }

    #[test]
    fn merge_buffer_region_frees_the_tail() {
        let s = space(4);
        let region = s.take_buffer_region().unwrap();
        let obj = region.try_bump(128).unwrap();
        region.set_top(obj + 128);
        s.merge_buffer_region(region);
        // Tail bytes are reusable without further expansion.
        assert!(s.allocate(1024, false).is_some());
        assert_eq!(s.committed(), REGION_SIZE);
    }
}
