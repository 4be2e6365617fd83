//! Lock-free work-stealing deque for gray objects.
//!
//! Based on: "Simple and Efficient Work-Stealing Queues for Parallel
//! Programming" by Chase and Lev (2005). The owning worker pushes and pops
//! at the bottom (LIFO); other workers steal from the top (FIFO). The buffer
//! is bounded; callers spill to a shared overflow pool when `push` fails.
//!
//! # Invariants
//!
//! - `N` must be a power of 2
//! - Queue is empty when `bottom == top`
//! - Queue is full when `bottom - top == N`

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct StealQueue<T: Copy, const N: usize> {
    buffer: UnsafeCell<[MaybeUninit<T>; N]>,
    bottom: AtomicUsize,
    top: AtomicUsize,
    mask: usize,
}

impl<T: Copy, const N: usize> StealQueue<T, N> {
    /// Create a new steal queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of 2.
    #[must_use]
    pub const fn new() -> Self {
        assert!(N.is_power_of_two(), "StealQueue size N must be a power of 2");

        Self {
            buffer: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
            bottom: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
            mask: N - 1,
        }
    }

    /// Push an item to the local end (LIFO). Owner only.
    ///
    /// Returns `true` if successful, `false` if the queue is full.
    pub fn push(&self, item: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= N {
            return false;
        }

        let index = b & self.mask;

        // SAFETY: the slot at `bottom & mask` is outside the live window
        // `top..bottom`, and only the owning worker writes at bottom.
        unsafe {
            (*self.buffer.get())[index].write(item);
        }

        // Release so the data write is visible to stealers before the
        // bottom increment, per the Chase-Lev protocol.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);

        true
    }

    /// Pop an item from the local end (LIFO). Owner only.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b == t {
            return None;
        }

        let new_b = b.wrapping_sub(1);
        // Release so stealers observe the shrunken window before racing on
        // the last element.
        self.bottom.store(new_b, Ordering::Release);

        let index = new_b & self.mask;

        // SAFETY: the queue was non-empty, so this slot was written by a
        // prior push; only the owner reads at bottom.
        let item = unsafe { (*self.buffer.get())[index].assume_init_read() };

        if new_b != t {
            return Some(item);
        }

        // Last item: synchronize with stealers through CAS on top.
        if self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A stealer took it first; restore the empty state.
            self.bottom.store(b, Ordering::Release);
            return None;
        }

        self.bottom.store(t.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Steal an item from the remote end (FIFO). Any thread.
    ///
    /// The CAS on top ensures at-most-once delivery when several stealers
    /// race on the same slot.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);

        if t == b || b.wrapping_sub(t) > N {
            return None;
        }

        let index = t & self.mask;
        // SAFETY: `top..bottom` is the live window; the release store in
        // push makes this slot's data visible before bottom moved past it.
        let item = unsafe { (*self.buffer.get())[index].assume_init_read() };

        if self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        Some(item)
    }

    /// Current number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        b.wrapping_sub(t)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }
}

impl<T: Copy, const N: usize> Default for StealQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the buffer is guarded by the Chase-Lev protocol: push/pop touch
// unique slots derived from bottom (owner only), steal synchronizes through
// CAS on top, and release/acquire ordering publishes slot data before the
// indices that expose it.
unsafe impl<T: Copy + Send, const N: usize> Send for StealQueue<T, N> {}

// SAFETY: see the Send impl.
unsafe impl<T: Copy + Send, const N: usize> Sync for StealQueue<T, N> {}
