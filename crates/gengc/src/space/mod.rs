//! Spaces: allocation policies over ordered collections of regions.
//!
//! - [`LinearSpace`]: atomic bump-pointer allocation (young halves,
//!   read-only, app-spawn).
//! - [`SparseSpace`]: segregated free lists (old, compress target,
//!   non-movable, machine-code).
//! - [`HugeSpace`]: one region per object.

mod huge;
mod linear;
mod sparse;

pub use huge::HugeSpace;
pub use linear::LinearSpace;
pub use sparse::SparseSpace;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::Address;
use crate::region::RegionKind;

/// The young generation: two bump-pointer halves swapped at the end of every
/// young collection. Allocation always goes to the active half; evacuation
/// copies into the inactive half, which the swap then activates.
pub struct SemiSpace {
    halves: [LinearSpace; 2],
    active: AtomicUsize,
}

impl SemiSpace {
    #[must_use]
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            halves: [
                LinearSpace::new(RegionKind::Young, "young", initial_capacity),
                LinearSpace::new(RegionKind::Young, "young", initial_capacity),
            ],
            active: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn active(&self) -> &LinearSpace {
        &self.halves[self.active.load(Ordering::Acquire)]
    }

    #[inline]
    #[must_use]
    pub fn inactive(&self) -> &LinearSpace {
        &self.halves[1 - self.active.load(Ordering::Acquire)]
    }

    /// Atomic bump allocation in the active half.
    #[inline]
    pub fn allocate_sync(&self, size: usize) -> Option<Address> {
        self.active().allocate_sync(size)
    }

    /// Makes the inactive half (holding this cycle's survivors) active.
    pub fn swap(&self) {
        self.active.fetch_xor(1, Ordering::AcqRel);
    }

    /// Stamps the age-mark watermark on every surviving region, so the next
    /// young cycle promotes the objects below it.
    pub fn seal_water_lines(&self) {
        self.active().for_each_region(crate::region::Region::seal_water_line);
    }

    /// Capacity of one half.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.active().capacity()
    }

    /// Grows or shrinks both halves, clamped to `[min, max]`.
    pub fn adjust_capacity(&self, target: usize, min: usize, max: usize) {
        let clamped = target.clamp(min, max);
        for half in &self.halves {
            half.set_capacity(clamped);
        }
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.halves.iter().map(LinearSpace::committed).sum()
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.active().used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_toggles_active_half() {
        let semi = SemiSpace::new(2 * crate::region::REGION_SIZE);
        let first = semi.active() as *const LinearSpace;
        semi.swap();
        assert!(!std::ptr::eq(first, semi.active()));
        assert!(std::ptr::eq(first, semi.inactive()));
        semi.swap();
        assert!(std::ptr::eq(first, semi.active()));
    }

    #[test]
    fn capacity_adjustment_is_clamped() {
        let semi = SemiSpace::new(2 * crate::region::REGION_SIZE);
        semi.adjust_capacity(usize::MAX, 1 << 20, 4 << 20);
        assert_eq!(semi.capacity(), 4 << 20);
        semi.adjust_capacity(0, 1 << 20, 4 << 20);
        assert_eq!(semi.capacity(), 1 << 20);
    }
}
