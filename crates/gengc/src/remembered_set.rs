//! Per-region remembered sets.
//!
//! A remembered set records slot addresses within one region that hold
//! pointers crossing a generational or spatial boundary. The write barrier
//! is the sole producer of old-to-new entries; evacuating traces rebuild
//! them as they update slots in place.

use crate::bitset::AtomicBitset;
use crate::object::{Address, SLOT_SIZE};

pub struct RememberedSet {
    base: Address,
    bits: AtomicBitset,
}

impl RememberedSet {
    /// Creates a set covering `len` bytes starting at `base`.
    #[must_use]
    pub fn new(base: Address, len: usize) -> Self {
        Self {
            base,
            bits: AtomicBitset::new(len / SLOT_SIZE),
        }
    }

    #[inline]
    fn index_of(&self, slot: Address) -> usize {
        debug_assert!(slot >= self.base, "slot below region base");
        debug_assert_eq!(slot % SLOT_SIZE, 0, "unaligned slot");
        (slot - self.base) / SLOT_SIZE
    }

    /// Records a slot. Lock-free; idempotent.
    #[inline]
    pub fn insert(&self, slot: Address) {
        self.bits.fetch_set(self.index_of(slot));
    }

    /// Whether `slot` is recorded.
    #[inline]
    #[must_use]
    pub fn contains(&self, slot: Address) -> bool {
        self.bits.test(self.index_of(slot))
    }

    /// Replays every recorded slot address.
    pub fn iterate(&self, mut f: impl FnMut(Address)) {
        let base = self.base;
        self.bits.iterate_set(|index| f(base + index * SLOT_SIZE));
    }

    /// Drops every entry covering `start..end` (used when the span is freed).
    pub fn clear_address_range(&self, start: Address, end: Address) {
        self.bits
            .clear_range(self.index_of(start), self.index_of(end));
    }

    pub fn clear_all(&self) {
        self.bits.clear_all();
    }

    /// Unions `other` into `self`; both must cover the same region.
    pub fn merge_from(&self, other: &Self) {
        debug_assert_eq!(self.base, other.base);
        self.bits.merge_from(&other.bits);
    }

    /// Number of recorded slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_iterate_round_trip() {
        let set = RememberedSet::new(0x10000, 4096);
        set.insert(0x10008);
        set.insert(0x10040);
        set.insert(0x10040);
        let mut slots = Vec::new();
        set.iterate(|s| slots.push(s));
        assert_eq!(slots, vec![0x10008, 0x10040]);
        assert!(set.contains(0x10008));
        assert!(!set.contains(0x10010));
    }

    #[test]
    fn clear_address_range_drops_covered_slots() {
        let set = RememberedSet::new(0x10000, 4096);
        set.insert(0x10008);
        set.insert(0x10100);
        set.insert(0x10200);
        set.clear_address_range(0x10100, 0x10200);
        let mut slots = Vec::new();
        set.iterate(|s| slots.push(s));
        assert_eq!(slots, vec![0x10008, 0x10200]);
    }

    #[test]
    fn merge_unions_two_sets() {
        let a = RememberedSet::new(0x10000, 4096);
        let b = RememberedSet::new(0x10000, 4096);
        a.insert(0x10008);
        b.insert(0x10010);
        a.merge_from(&b);
        assert_eq!(a.len(), 2);
    }
}
