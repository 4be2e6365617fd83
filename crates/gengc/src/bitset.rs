//! Lock-free atomic bitset backing mark bits and remembered sets.
//!
//! Memory ordering contract: setters publish with release semantics and
//! cross-thread scans read with acquire, so a bit observed set happens-after
//! the write that set it. Single-owner readers may use the relaxed `test`.

use std::sync::atomic::{AtomicUsize, Ordering};

const BITS_PER_WORD: usize = usize::BITS as usize;

pub struct AtomicBitset {
    words: Box<[AtomicUsize]>,
    len: usize,
}

impl AtomicBitset {
    #[must_use]
    pub fn new(len: usize) -> Self {
        let word_count = len.div_ceil(BITS_PER_WORD);
        let words = (0..word_count).map(|_| AtomicUsize::new(0)).collect();
        Self { words, len }
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `index`; returns `true` when this call was the first setter.
    #[inline]
    pub fn fetch_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let mask = 1 << (index % BITS_PER_WORD);
        let prev = self.words[index / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Non-atomic-intent read, valid only when no concurrent writer can race.
    #[inline]
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let mask = 1 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].load(Ordering::Relaxed) & mask != 0
    }

    /// Clears bit `index`.
    #[inline]
    pub fn clear(&self, index: usize) {
        debug_assert!(index < self.len);
        let mask = 1 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clears every bit in `start..end`.
    pub fn clear_range(&self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.len);
        for index in start..end {
            self.clear(index);
        }
    }

    /// Clears the whole set.
    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Invokes `f` with the index of every set bit, in ascending order.
    pub fn iterate_set(&self, mut f: impl FnMut(usize)) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let index = word_index * BITS_PER_WORD + bit;
                if index < self.len {
                    f(index);
                }
            }
        }
    }

    /// ORs every set bit of `other` into `self`. Lengths must match.
    pub fn merge_from(&self, other: &Self) {
        debug_assert_eq!(self.len, other.len);
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            let bits = src.load(Ordering::Acquire);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fetch_set_reports_first_setter_only() {
        let bits = AtomicBitset::new(256);
        assert!(bits.fetch_set(7));
        assert!(!bits.fetch_set(7));
        assert!(bits.test(7));
        assert!(!bits.test(8));
    }

    #[test]
    fn clear_range_spans_word_boundaries() {
        let bits = AtomicBitset::new(200);
        for i in 0..200 {
            bits.fetch_set(i);
        }
        bits.clear_range(60, 70);
        for i in 60..70 {
            assert!(!bits.test(i), "bit {i} should be clear");
        }
        assert!(bits.test(59));
        assert!(bits.test(70));
        assert_eq!(bits.count(), 190);
    }

    #[test]
    fn iterate_set_visits_ascending() {
        let bits = AtomicBitset::new(300);
        for i in [0, 63, 64, 65, 299] {
            bits.fetch_set(i);
        }
        let mut seen = Vec::new();
        bits.iterate_set(|i| seen.push(i));
        assert_eq!(seen, vec![0, 63, 64, 65, 299]);
    }

    #[test]
    fn merge_from_unions() {
        let a = AtomicBitset::new(128);
        let b = AtomicBitset::new(128);
        a.fetch_set(1);
        b.fetch_set(100);
        a.merge_from(&b);
        assert!(a.test(1));
        assert!(a.test(100));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn concurrent_setters_see_exactly_one_winner_per_bit() {
        let bits = Arc::new(AtomicBitset::new(1024));
        let wins: Vec<_> = (0..4)
            .map(|_| {
                let bits = Arc::clone(&bits);
                std::thread::spawn(move || {
                    let mut won = 0usize;
                    for i in 0..1024 {
                        if bits.fetch_set(i) {
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();
        let total: usize = wins.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1024);
        assert_eq!(bits.count(), 1024);
    }
}
