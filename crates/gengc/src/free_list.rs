//! Segregated free lists for sparse (old / non-movable / machine-code) spaces.
//!
//! Every free span carries an in-memory header so object iteration can walk
//! a sparse region linearly: spans of 8 or 16 bytes get a dedicated filler
//! descriptor, larger spans use [`FREE_SPAN`] with the length stored in the
//! word after the header.

use crate::object::{
    Address, FREE_SPAN, FREE_SPAN_ONE, FREE_SPAN_TWO, HEADER_SIZE, MarkWord, SLOT_SIZE,
};

/// Smallest span kept on the list; smaller remainders become fillers.
pub const MIN_FREE_SPAN: usize = 3 * SLOT_SIZE;

/// Bins for spans up to `SMALL_BIN_COUNT * SLOT_SIZE` bytes, then one
/// first-fit overflow list.
const SMALL_BIN_COUNT: usize = 64;

pub struct FreeList {
    small: Vec<Vec<(Address, usize)>>,
    large: Vec<(Address, usize)>,
    available: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            small: (0..SMALL_BIN_COUNT).map(|_| Vec::new()).collect(),
            large: Vec::new(),
            available: 0,
        }
    }

    /// Bytes currently on the list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available
    }

    fn bin_of(size: usize) -> Option<usize> {
        let bin = size / SLOT_SIZE;
        (bin < SMALL_BIN_COUNT).then_some(bin)
    }

    /// Writes a free-span header over `start..start + size`.
    ///
    /// # Safety
    ///
    /// The span must lie inside a mapped region and hold no live object.
    unsafe fn write_span_header(start: Address, size: usize) {
        debug_assert_eq!(size % SLOT_SIZE, 0);
        let word = unsafe { MarkWord::of(start) };
        match size {
            SLOT_SIZE => word.install(&FREE_SPAN_ONE),
            s if s == 2 * SLOT_SIZE => word.install(&FREE_SPAN_TWO),
            _ => {
                word.install(&FREE_SPAN);
                unsafe { crate::object::store_slot(start + HEADER_SIZE, size) };
            }
        }
    }

    /// Returns a span to the list, installing its in-memory header.
    ///
    /// # Safety
    ///
    /// See [`Self::write_span_header`].
    pub unsafe fn free(&mut self, start: Address, size: usize) {
        if size == 0 {
            return;
        }
        unsafe { Self::write_span_header(start, size) };
        if size < MIN_FREE_SPAN {
            // Fillers keep iteration walkable but are too small to reuse.
            return;
        }
        self.available += size;
        match Self::bin_of(size) {
            Some(bin) => self.small[bin].push((start, size)),
            None => self.large.push((start, size)),
        }
    }

    /// Carves `size` bytes out of the list, splitting the chosen span.
    /// The caller installs the object header; leftover bytes are re-freed.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        debug_assert_eq!(size % SLOT_SIZE, 0);
        let (start, span) = self.take_span(size)?;
        self.available -= span;
        let remainder = span - size;
        if remainder > 0 {
            // SAFETY: the tail of a span we own is free memory.
            unsafe { self.free(start + size, remainder) };
        }
        Some(start)
    }

    fn take_span(&mut self, size: usize) -> Option<(Address, usize)> {
        // Exact or next-larger small bin first.
        if let Some(first_bin) = Self::bin_of(size) {
            for bin in first_bin..SMALL_BIN_COUNT {
                if let Some(span) = self.small[bin].pop() {
                    return Some(span);
                }
            }
        }
        // First fit on the overflow list.
        let index = self.large.iter().position(|&(_, len)| len >= size)?;
        Some(self.large.swap_remove(index))
    }

    /// Drops all bookkeeping without touching memory. Used when a space's
    /// regions are about to be swept or released wholesale.
    pub fn reset(&mut self) {
        for bin in &mut self.small {
            bin.clear();
        }
        self.large.clear();
        self.available = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::size_of_object;
    use crate::region::{Region, RegionKind};

    fn region_with_free_payload() -> (Box<Region>, FreeList) {
        let region = Region::new(RegionKind::Old);
        let mut list = FreeList::new();
        let payload = region.end() - region.begin();
        unsafe { list.free(region.begin(), payload) };
        region.set_top(region.end());
        (region, list)
    }

    #[test]
    fn allocate_splits_and_refrees_remainder() {
        let (region, mut list) = region_with_free_payload();
        let before = list.available();
        let a = list.allocate(64).unwrap();
        assert_eq!(a, region.begin());
        assert_eq!(list.available(), before - 64);
        // The remainder must be walkable as a free span.
        assert_eq!(unsafe { size_of_object(a + 64) }, before - 64);
    }

    #[test]
    fn small_remainders_become_fillers() {
        let (region, mut list) = region_with_free_payload();
        let payload = list.available();
        // Leave exactly 16 bytes: too small for the list, kept as filler.
        let a = list.allocate(payload - 16).unwrap();
        assert_eq!(list.available(), 0);
        assert!(list.allocate(16).is_none());
        let filler = a + payload - 16;
        assert_eq!(unsafe { size_of_object(filler) }, 16);
        drop(region);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut list = FreeList::new();
        assert!(list.allocate(32).is_none());
    }

    #[test]
    fn large_spans_are_first_fit() {
        let (region, mut list) = region_with_free_payload();
        // Take a chunk so the remaining large span shrinks; allocations far
        // beyond the small bins must still succeed from the overflow list.
        let big = 4096;
        let a = list.allocate(big).unwrap();
        let b = list.allocate(big).unwrap();
        assert_ne!(a, b);
        assert!(a >= region.begin() && b >= region.begin());
    }
}
