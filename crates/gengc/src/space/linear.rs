//! Bump-pointer spaces.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::Address;
use crate::region::{REGION_SIZE, Region, RegionKind};

/// A bump-pointer space. Mutator threads and GC workers may allocate
/// concurrently: the hot path is one atomic fetch-update on the current
/// region's top, and only region rollover takes the region-list lock.
pub struct LinearSpace {
    kind: RegionKind,
    name: &'static str,
    current: AtomicPtr<Region>,
    regions: Mutex<Vec<Box<Region>>>,
    committed: AtomicUsize,
    capacity: AtomicUsize,
}

impl LinearSpace {
    #[must_use]
    pub fn new(kind: RegionKind, name: &'static str, capacity: usize) -> Self {
        Self {
            kind,
            name,
            current: AtomicPtr::new(std::ptr::null_mut()),
            regions: Mutex::new(Vec::new()),
            committed: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Atomic bump allocation; expands by one region when the current one is
    /// exhausted and capacity allows.
    pub fn allocate_sync(&self, size: usize) -> Option<Address> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if !current.is_null() {
                // SAFETY: `current` points at a region owned by this space's
                // region list, which never drops entries while it is current.
                if let Some(addr) = unsafe { (*current).try_bump(size) } {
                    return Some(addr);
                }
            }

            let mut regions = self.regions.lock();
            // Another thread may have rolled over while we waited.
            if self.current.load(Ordering::Acquire) != current {
                continue;
            }
            if self.committed.load(Ordering::Acquire) + REGION_SIZE
                > self.capacity.load(Ordering::Acquire)
            {
                return None;
            }
            let region = Region::new(self.kind);
            self.committed.fetch_add(REGION_SIZE, Ordering::AcqRel);
            self.current
                .store(std::ptr::from_ref(&*region).cast_mut(), Ordering::Release);
            regions.push(region);
        }
    }

    /// Hands out a fresh region for a worker-local evacuation buffer; the
    /// region is not published until [`Self::merge_region`].
    pub fn take_buffer_region(&self) -> Option<Box<Region>> {
        let committed = self.committed.load(Ordering::Acquire);
        if committed + REGION_SIZE > self.capacity.load(Ordering::Acquire) {
            return None;
        }
        self.committed.fetch_add(REGION_SIZE, Ordering::AcqRel);
        Some(Region::new(self.kind))
    }

    /// Publishes a merged buffer region. Only the region-insertion lock is
    /// taken; the bytes are already laid out.
    pub fn merge_region(&self, region: Box<Region>) {
        self.regions.lock().push(region);
    }

    /// Removes and returns every region, resetting the space to empty.
    pub fn take_regions(&self) -> Vec<Box<Region>> {
        let mut regions = self.regions.lock();
        self.current.store(std::ptr::null_mut(), Ordering::Release);
        self.committed.store(0, Ordering::Release);
        std::mem::take(&mut *regions)
    }

    pub fn for_each_region(&self, mut f: impl FnMut(&Region)) {
        for region in self.regions.lock().iter() {
            f(region);
        }
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Bytes allocated across all regions.
    #[must_use]
    pub fn used(&self) -> usize {
        let mut used = 0;
        self.for_each_region(|r| used += r.used());
        used
    }

    /// Number of live objects found by walking every region linearly.
    pub fn iterate_objects(&self, mut f: impl FnMut(Address)) {
        self.for_each_region(|region| {
            let mut addr = region.begin();
            let top = region.top();
            while addr < top {
                // SAFETY: linear regions hold contiguously bumped objects
                // with installed headers.
                let size = unsafe { crate::object::size_of_object(addr) };
                f(addr);
                addr += size;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_rolls_over_regions() {
        let space = LinearSpace::new(RegionKind::Young, "young", 2 * REGION_SIZE);
        let first = space.allocate_sync(64).unwrap();
        // Exhaust the first region.
        while space.committed() == REGION_SIZE {
            if space.allocate_sync(4096).is_none() {
                break;
            }
        }
        assert_eq!(space.committed(), 2 * REGION_SIZE);
        assert_ne!(first, 0);
    }

    #[test]
    fn capacity_bounds_expansion() {
        let space = LinearSpace::new(RegionKind::Young, "young", REGION_SIZE);
        assert!(space.allocate_sync(64).is_some());
        let mut exhausted = false;
        for _ in 0..REGION_SIZE / 64 + 2 {
            if space.allocate_sync(64).is_none() {
                exhausted = true;
                break;
            }
        }
        assert!(exhausted);
        assert_eq!(space.committed(), REGION_SIZE);
    }

    #[test]
    fn take_regions_empties_the_space() {
        let space = LinearSpace::new(RegionKind::Young, "young", 4 * REGION_SIZE);
        space.allocate_sync(64).unwrap();
        let regions = space.take_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(space.committed(), 0);
        assert_eq!(space.used(), 0);
    }

    #[test]
    fn parallel_bumps_yield_distinct_addresses() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let space = Arc::new(LinearSpace::new(RegionKind::Young, "young", 8 * REGION_SIZE));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let space = Arc::clone(&space);
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| space.allocate_sync(32).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert!(seen.insert(addr), "duplicate address {addr:#x}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
