//! Regions: fixed-size, aligned memory chunks and their per-object metadata.
//!
//! A region is the unit of allocation bookkeeping. All per-object metadata —
//! mark bits and the three remembered sets — hangs off the region owning the
//! object. The first word of the mapped block points back at the `Region`
//! struct, so `Region::from_object` is a mask plus one load.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};
use tracing::error;

use crate::object::{Address, HEADER_SIZE, SLOT_SIZE, align_up};
use crate::remembered_set::RememberedSet;

/// Size and alignment of a regular region.
pub const REGION_SIZE: usize = 256 * 1024;

const REGION_MASK: usize = REGION_SIZE - 1;

/// Which space a region belongs to. Set at creation and never changed; a
/// region moves between space containers only during the old/compress swap,
/// where both sides hold old-generation regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionKind {
    Young,
    Old,
    NonMovable,
    MachineCode,
    Huge,
    ReadOnly,
    AppSpawn,
}

impl RegionKind {
    /// Immortal regions are never reclaimed and their objects never die.
    #[must_use]
    pub fn is_immortal(self) -> bool {
        matches!(self, Self::ReadOnly | Self::AppSpawn)
    }
}

const IN_COLLECT_SET: u32 = 1 << 0;
const SWEEPING: u32 = 1 << 1;
const FRESH_DURING_MARK: u32 = 1 << 2;

pub struct Region {
    map: Mmap,
    kind: RegionKind,
    /// First object address (after the back-pointer word).
    begin: Address,
    end: Address,
    top: AtomicUsize,
    /// Age-mark watermark: objects below it survived a previous young cycle.
    /// `0` means no watermark.
    water_line: AtomicUsize,
    flags: AtomicU32,
    mark_bits: crate::bitset::AtomicBitset,
    old_to_new: AtomicPtr<RememberedSet>,
    cross_region: AtomicPtr<RememberedSet>,
    sweeping_rset: AtomicPtr<RememberedSet>,
    /// Guards remembered-set creation only; inserts are lock-free.
    rset_lock: Mutex<()>,
}

impl Region {
    /// Maps a regular region. Region creation failure means the OS refused
    /// memory the heap's accounting already approved, which is fatal.
    pub fn new(kind: RegionKind) -> Box<Self> {
        Self::with_len(kind, REGION_SIZE)
    }

    /// Maps a huge region sized for a single object of `object_size` bytes.
    pub fn new_huge(object_size: usize) -> Box<Self> {
        let len = align_up(HEADER_SIZE + object_size, REGION_SIZE);
        Self::with_len(RegionKind::Huge, len)
    }

    fn with_len(kind: RegionKind, len: usize) -> Box<Self> {
        let map = match unsafe { MmapOptions::new().len(len).align(REGION_SIZE).map_anon() } {
            Ok(map) => map,
            Err(err) => {
                error!(?kind, len, %err, "region mapping failed");
                panic!("out of system memory mapping a {len}-byte region");
            }
        };

        let base = map.ptr() as Address;
        let begin = base + HEADER_SIZE;
        let region = Box::new(Self {
            kind,
            begin,
            end: base + len,
            top: AtomicUsize::new(begin),
            water_line: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            mark_bits: crate::bitset::AtomicBitset::new(len / SLOT_SIZE),
            old_to_new: AtomicPtr::new(std::ptr::null_mut()),
            cross_region: AtomicPtr::new(std::ptr::null_mut()),
            sweeping_rset: AtomicPtr::new(std::ptr::null_mut()),
            rset_lock: Mutex::new(()),
            map,
        });

        // Back pointer for `from_object`. Written once before the region is
        // published to any other thread.
        unsafe {
            *(base as *mut usize) = &*region as *const Self as usize;
        }
        region
    }

    /// Resolves the region owning `object`.
    ///
    /// # Safety
    ///
    /// `object` must be the base address of an object (or a region's `begin`)
    /// inside a live region. Interior addresses of huge objects would mask to
    /// an unmapped header; callers must always pass object bases.
    #[inline]
    pub unsafe fn from_object<'a>(object: Address) -> &'a Self {
        let base = object & !REGION_MASK;
        unsafe { &*(*(base as *const *const Self)) }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Start of the mapped block.
    #[inline]
    #[must_use]
    pub fn base(&self) -> Address {
        self.map.ptr() as Address
    }

    /// First object address.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> Address {
        self.begin
    }

    #[inline]
    #[must_use]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.begin && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    /// Bytes of mapped memory.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.map.len()
    }

    /// Bytes allocated so far.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.begin
    }

    /// Atomically bumps the allocation top. Returns the object address, or
    /// `None` when the region cannot fit `size` more bytes.
    #[inline]
    pub fn try_bump(&self, size: usize) -> Option<Address> {
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top + size <= self.end).then_some(top + size)
            })
            .ok()
    }

    // ---- flags ----

    pub fn set_in_collect_set(&self, value: bool) {
        self.set_flag(IN_COLLECT_SET, value);
    }

    #[inline]
    #[must_use]
    pub fn in_collect_set(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_COLLECT_SET != 0
    }

    pub fn set_sweeping(&self, value: bool) {
        self.set_flag(SWEEPING, value);
    }

    #[inline]
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SWEEPING != 0
    }

    /// Marks a region created while a concurrent trace was running; the
    /// sweeper must skip it because nothing in it was traced.
    pub fn set_fresh_during_mark(&self, value: bool) {
        self.set_flag(FRESH_DURING_MARK, value);
    }

    #[inline]
    #[must_use]
    pub fn is_fresh_during_mark(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FRESH_DURING_MARK != 0
    }

    fn set_flag(&self, flag: u32, value: bool) {
        if value {
            self.flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    // ---- age mark ----

    /// Sets the age-mark watermark to the current allocation top.
    pub fn seal_water_line(&self) {
        self.water_line.store(self.top(), Ordering::Release);
    }

    /// Whether `object` survived a previous young cycle.
    #[inline]
    #[must_use]
    pub fn below_water_line(&self, object: Address) -> bool {
        let line = self.water_line.load(Ordering::Acquire);
        line != 0 && object < line
    }

    // ---- mark bits ----

    #[inline]
    fn bit_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.base() && addr < self.end);
        (addr - self.base()) / SLOT_SIZE
    }

    /// Sets the mark bit covering `addr`; returns `true` for the first setter.
    #[inline]
    pub fn atomic_mark(&self, addr: Address) -> bool {
        self.mark_bits.fetch_set(self.bit_index(addr))
    }

    /// Reads the mark bit without synchronization; valid only when no marker
    /// can race with the read.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.mark_bits.test(self.bit_index(addr))
    }

    pub fn clear_mark_bits(&self) {
        self.mark_bits.clear_all();
    }

    // ---- remembered sets ----

    fn ensure_rset(&self, which: &AtomicPtr<RememberedSet>) -> &RememberedSet {
        let existing = which.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let _guard = self.rset_lock.lock();
        let raced = which.load(Ordering::Acquire);
        if !raced.is_null() {
            return unsafe { &*raced };
        }
        let created = Box::into_raw(Box::new(RememberedSet::new(self.base(), self.committed())));
        which.store(created, Ordering::Release);
        unsafe { &*created }
    }

    fn rset(which: &AtomicPtr<RememberedSet>) -> Option<&RememberedSet> {
        let ptr = which.load(Ordering::Acquire);
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    fn take_rset(which: &AtomicPtr<RememberedSet>) -> Option<Box<RememberedSet>> {
        let ptr = which.swap(std::ptr::null_mut(), Ordering::AcqRel);
        (!ptr.is_null()).then(|| unsafe { Box::from_raw(ptr) })
    }

    pub fn insert_old_to_new_rset(&self, slot: Address) {
        self.ensure_rset(&self.old_to_new).insert(slot);
    }

    pub fn insert_cross_region_rset(&self, slot: Address) {
        self.ensure_rset(&self.cross_region).insert(slot);
    }

    pub fn insert_sweeping_rset(&self, slot: Address) {
        self.ensure_rset(&self.sweeping_rset).insert(slot);
    }

    /// Whether `slot` is recorded in the old-to-new set.
    #[must_use]
    pub fn old_to_new_contains(&self, slot: Address) -> bool {
        Self::rset(&self.old_to_new).is_some_and(|set| set.contains(slot))
    }

    /// Replays every recorded old-to-new slot.
    pub fn iterate_old_to_new(&self, f: impl FnMut(Address)) {
        if let Some(set) = Self::rset(&self.old_to_new) {
            set.iterate(f);
        }
    }

    /// Swaps the old-to-new set out for rebuild during an evacuating trace.
    pub fn take_old_to_new_rset(&self) -> Option<Box<RememberedSet>> {
        Self::take_rset(&self.old_to_new)
    }

    pub fn clear_old_to_new_rset(&self) {
        if let Some(set) = Self::rset(&self.old_to_new) {
            set.clear_all();
        }
    }

    /// Drops old-to-new entries covering a freed span.
    pub fn clear_old_to_new_range(&self, start: Address, end: Address) {
        if let Some(set) = Self::rset(&self.old_to_new) {
            set.clear_address_range(start, end);
        }
    }

    pub fn clear_cross_region_rset(&self) {
        if let Some(set) = Self::rset(&self.cross_region) {
            set.clear_all();
        }
    }

    pub fn iterate_cross_region(&self, f: impl FnMut(Address)) {
        if let Some(set) = Self::rset(&self.cross_region) {
            set.iterate(f);
        }
    }

    /// Folds barrier entries recorded during a concurrent sweep back into
    /// the old-to-new set.
    pub fn merge_sweeping_rset(&self) {
        if let Some(pending) = Self::take_rset(&self.sweeping_rset) {
            self.ensure_rset(&self.old_to_new).merge_from(&pending);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        for which in [&self.old_to_new, &self.cross_region, &self.sweeping_rset] {
            drop(Self::take_rset(which));
        }
    }
}
