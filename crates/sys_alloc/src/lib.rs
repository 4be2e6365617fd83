use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Mappings are always aligned to at least this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to an anonymous memory mapping.
///
/// The mapping is unmapped when this handle is dropped.
#[derive(Debug)]
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    ///
    /// Mappings produced by [`MmapOptions::map_anon`] are never empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating an anonymous memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start address of the mapping to be aligned to `align`.
    ///
    /// `align` must be a power of two. Alignments up to the allocation
    /// granularity are free; larger ones are satisfied by over-mapping and
    /// trimming the excess, so the kernel only ever sees page-granular
    /// operations.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to skip swap-space reservation (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous read-write memory mapping.
    ///
    /// # Safety
    ///
    /// The returned mapping owns its memory, but the raw pointer it yields
    /// is unchecked: callers must not access it beyond `len` bytes or after
    /// the `Mmap` is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let align = self.align.max(allocation_granularity());
        let inner = unsafe {
            os::MmapInner::map_anon_aligned(self.len, align, self.populate, self.no_reserve)?
        };

        debug_assert_eq!(inner.ptr() as usize % align, 0);
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("failed to map") };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_aligned_map() {
        // Alignments well beyond the allocation granularity must hold exactly.
        for align in [1 << 16, 1 << 18, 1 << 20] {
            let len = align;
            let mmap = unsafe {
                MmapOptions::new()
                    .len(len)
                    .align(align)
                    .map_anon()
                    .expect("failed to map aligned")
            };

            let ptr = mmap.ptr();
            assert_eq!(ptr as usize % align, 0, "align {align:#x}");
            assert_eq!(mmap.len(), len);

            // Both ends of the trimmed mapping must be usable.
            unsafe {
                ptr::write_volatile(ptr, 1);
                ptr::write_volatile(ptr.add(len - 1), 2);
                assert_eq!(ptr::read_volatile(ptr), 1);
                assert_eq!(ptr::read_volatile(ptr.add(len - 1)), 2);
            }
        }
    }

    #[test]
    fn test_len_smaller_than_align() {
        let align = 1 << 18;
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .align(align)
                .map_anon()
                .expect("failed to map")
        };
        assert_eq!(mmap.ptr() as usize % align, 0);
        assert_eq!(mmap.len(), len);
    }

    #[test]
    fn test_rejects_non_power_of_two_align() {
        let err = unsafe {
            MmapOptions::new()
                .len(page_size())
                .align(3 * page_size())
                .map_anon()
                .unwrap_err()
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_no_reserve_map() {
        let len = 4 * page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .no_reserve(true)
                .map_anon()
                .expect("failed to map")
        };
        unsafe {
            ptr::write_volatile(mmap.ptr().add(len / 2), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(len / 2)), 7);
        }
    }
}
