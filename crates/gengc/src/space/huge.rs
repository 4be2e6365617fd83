//! Huge-object space: one region per object.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::{Address, align_up};
use crate::region::Region;

pub struct HugeSpace {
    regions: Mutex<Vec<Box<Region>>>,
    committed: AtomicUsize,
    max_capacity: usize,
}

impl HugeSpace {
    #[must_use]
    pub fn new(max_capacity: usize) -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            committed: AtomicUsize::new(0),
            max_capacity,
        }
    }

    /// Maps a dedicated region for one object of `size` bytes.
    pub fn allocate(&self, size: usize, fresh_during_mark: bool) -> Option<Address> {
        let size = align_up(size, crate::object::SLOT_SIZE);
        let mapped = align_up(crate::object::HEADER_SIZE + size, crate::region::REGION_SIZE);
        if self.committed.load(Ordering::Acquire) + mapped > self.max_capacity {
            return None;
        }
        let region = Region::new_huge(size);
        self.committed.fetch_add(region.committed(), Ordering::AcqRel);
        let object = region.begin();
        region.set_top(object + size);
        if fresh_during_mark {
            region.set_fresh_during_mark(true);
        }
        self.regions.lock().push(region);
        Some(object)
    }

    /// Releases every region whose object was not marked this cycle.
    /// Returns the number of bytes unmapped.
    pub fn sweep(&self) -> usize {
        let mut freed = 0;
        self.regions.lock().retain(|region| {
            if region.is_fresh_during_mark() {
                region.set_fresh_during_mark(false);
                return true;
            }
            if region.is_marked(region.begin()) {
                true
            } else {
                freed += region.committed();
                false
            }
        });
        self.committed.fetch_sub(freed, Ordering::AcqRel);
        freed
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

    /// Visits every huge object.
    pub fn iterate_objects(&self, mut f: impl FnMut(Address)) {
        self.for_each_region(|region| f(region.begin()));
    }
}
